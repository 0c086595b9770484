/*
[INPUT]:  Endpoint URL, outgoing frames, raw socket traffic
[OUTPUT]: Decoded frames dispatched to correlator/registry, death notifications
[POS]:    WebSocket layer - socket ownership, single read loop, single writer
[UPDATE]: When connection handling or frame dispatch changes
*/

use std::fmt;
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::cache::PriceCache;
use super::correlator::Correlator;
use super::registry::Registry;
use super::wire::Envelope;
use crate::config::SessionConfig;
use crate::error::{DerivError, Result};
use crate::types::{BalanceData, TickData, Topic};

const MALFORMED_LOG_LIMIT: usize = 3;

/// Lifecycle of one socket. `Failed` requires a manual reconnect; the other
/// non-Ready states are transient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Authorizing,
    Ready,
    Closing,
    Failed,
}

impl SessionState {
    /// True once the retry budget is gone or auth was rejected; the owner
    /// must call `connect()` again explicitly.
    pub fn requires_manual_reconnect(&self) -> bool {
        matches!(self, SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Authorizing => "authorizing",
            SessionState::Ready => "ready",
            SessionState::Closing => "closing",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub(crate) enum DeathReason {
    ReadError(String),
    WriteFailed,
    Closed,
}

/// Sent by the socket task exactly once, when it exits
#[derive(Debug)]
pub(crate) struct SessionDeath {
    pub epoch: u64,
    pub reason: DeathReason,
}

/// Write side of the current session, tagged with the session's epoch.
/// Installed on open, cleared when the socket task exits, shared by the
/// correlator and the handshake path.
pub(crate) struct Outbound {
    slot: Mutex<Option<OutboundSlot>>,
}

struct OutboundSlot {
    epoch: u64,
    tx: mpsc::Sender<Message>,
}

impl Outbound {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    pub(crate) fn install(&self, epoch: u64, tx: mpsc::Sender<Message>) {
        *self.slot.lock().unwrap() = Some(OutboundSlot { epoch, tx });
    }

    /// Clear only if the slot still belongs to the given session's channel,
    /// so a dying task cannot wipe its successor's writer.
    fn clear_matching(&self, tx: &mpsc::Sender<Message>) {
        let mut slot = self.slot.lock().unwrap();
        if slot.as_ref().is_some_and(|cur| cur.tx.same_channel(tx)) {
            *slot = None;
        }
    }

    fn sender(&self, scope: Option<u64>) -> Result<mpsc::Sender<Message>> {
        let slot = self.slot.lock().unwrap();
        let current = slot.as_ref().ok_or(DerivError::NotConnected)?;
        if let Some(epoch) = scope
            && current.epoch != epoch
        {
            // The session that admitted this request is gone; its successor
            // must not see the frame before its own handshake completes.
            return Err(DerivError::ConnectionLost);
        }
        Ok(current.tx.clone())
    }

    /// Write to the current session regardless of which session admitted
    /// the frame. Handshake and replay traffic uses this.
    pub(crate) async fn send_json(&self, frame: &Value) -> Result<()> {
        self.send_json_scoped(frame, None).await
    }

    /// Write only if the session with the given epoch is still the one
    /// installed.
    pub(crate) async fn send_json_scoped(&self, frame: &Value, scope: Option<u64>) -> Result<()> {
        let tx = self.sender(scope)?;
        tx.send(Message::Text(frame.to_string().into()))
            .await
            .map_err(|_| DerivError::NotConnected)
    }
}

/// One connected lifetime of the socket. Exactly one task owns both halves:
/// it is the only reader and the only writer.
pub(crate) struct Session {
    epoch: u64,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Session {
    pub(crate) async fn open(
        config: &SessionConfig,
        epoch: u64,
        outbound: Arc<Outbound>,
        correlator: Arc<Correlator>,
        registry: Arc<Registry>,
        cache: Arc<PriceCache>,
        deaths: mpsc::UnboundedSender<SessionDeath>,
    ) -> Result<Self> {
        let (ws_stream, _response) = connect_async(config.endpoint.as_str())
            .await
            .map_err(|err| DerivError::Connect(err.to_string()))?;
        info!(endpoint = %config.endpoint, epoch, "websocket connected");

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::channel(config.outbound_capacity);
        outbound.install(epoch, tx.clone());
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let keepalive = config.keepalive_interval;

        let task = tokio::spawn(async move {
            let mut keepalive_timer = interval_at(Instant::now() + keepalive, keepalive);
            keepalive_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut malformed_seen = 0usize;

            let reason = loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        let _ = write.send(Message::Close(None)).await;
                        break DeathReason::Closed;
                    }
                    _ = keepalive_timer.tick() => {
                        if write.send(Message::Ping(Vec::new().into())).await.is_err() {
                            break DeathReason::WriteFailed;
                        }
                    }
                    frame = rx.recv() => match frame {
                        Some(message) => {
                            if write.send(message).await.is_err() {
                                break DeathReason::WriteFailed;
                            }
                        }
                        None => {
                            let _ = write.send(Message::Close(None)).await;
                            break DeathReason::Closed;
                        }
                    },
                    incoming = read.next() => match incoming {
                        Some(Ok(Message::Text(text))) => {
                            dispatch_frame(
                                text.as_str(),
                                &correlator,
                                &registry,
                                &cache,
                                &mut malformed_seen,
                            );
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            match String::from_utf8(bytes.to_vec()) {
                                Ok(text) => dispatch_frame(
                                    &text,
                                    &correlator,
                                    &registry,
                                    &cache,
                                    &mut malformed_seen,
                                ),
                                Err(_) => debug!("dropping non-utf8 binary frame"),
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            if write.send(Message::Pong(payload)).await.is_err() {
                                break DeathReason::WriteFailed;
                            }
                        }
                        Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                        Some(Ok(Message::Close(frame))) => {
                            break DeathReason::ReadError(format!("closed by venue: {frame:?}"));
                        }
                        Some(Err(err)) => break DeathReason::ReadError(err.to_string()),
                        None => break DeathReason::ReadError("socket eof".into()),
                    }
                }
            };

            outbound.clear_matching(&tx);
            debug!(epoch, ?reason, "socket task exiting");
            let _ = deaths.send(SessionDeath { epoch, reason });
        });

        Ok(Self {
            epoch,
            shutdown: shutdown_tx,
            task,
        })
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Signal the socket task and wait for it to fully exit
    pub(crate) async fn close(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

/// Route one decoded frame: pending reply first, then topic push. Malformed
/// frames are logged and skipped; they never kill the session.
fn dispatch_frame(
    text: &str,
    correlator: &Correlator,
    registry: &Registry,
    cache: &PriceCache,
    malformed_seen: &mut usize,
) {
    let envelope = match Envelope::decode(text) {
        Ok(envelope) => envelope,
        Err(err) => {
            log_malformed(&err, text.len(), malformed_seen);
            return;
        }
    };

    // Every tick and balance frame feeds the cache, including the snapshot
    // that doubles as the subscribe reply.
    if let Some(tick) = envelope.payload.get("tick")
        && let Ok(tick) = serde_json::from_value::<TickData>(tick.clone())
    {
        cache.record(tick);
    }
    if let Some(balance) = envelope.payload.get("balance")
        && let Ok(balance) = serde_json::from_value::<BalanceData>(balance.clone())
    {
        cache.record_balance(balance);
    }

    if let Some(id) = envelope.req_id
        && correlator.resolve(id, envelope.result())
    {
        return;
    }

    if let Some(failure) = &envelope.error {
        warn!(
            code = %failure.code,
            message = %failure.message,
            "venue error with no matching waiter"
        );
        return;
    }

    match envelope
        .msg_type
        .as_deref()
        .and_then(|msg_type| Topic::from_push(msg_type, &envelope.payload))
    {
        Some(topic) => registry.on_push(&topic, envelope.payload),
        None => debug!(msg_type = ?envelope.msg_type, "unrouted frame"),
    }
}

/// Warn for the first few malformed frames of a session, then drop to debug
fn log_malformed(err: &DerivError, bytes: usize, seen: &mut usize) {
    *seen += 1;
    if *seen <= MALFORMED_LOG_LIMIT {
        warn!(
            sample_index = *seen,
            sample_limit = MALFORMED_LOG_LIMIT,
            error = %err,
            bytes,
            "malformed frame skipped"
        );
    } else {
        debug!(error = %err, bytes, "malformed frame skipped");
    }
}
