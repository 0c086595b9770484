/*
[INPUT]:  Caller requests, subscriptions and lifecycle calls
[OUTPUT]: Replies, topic streams and session state over one managed socket
[POS]:    WebSocket layer - public client facade and session lifecycle owner
[UPDATE]: When the public surface or connect/close flow changes
*/

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{info, warn};

use super::cache::PriceCache;
use super::correlator::Correlator;
use super::registry::{Registry, TopicStream};
use super::session::{Outbound, Session, SessionDeath, SessionState};
use super::{supervisor, wire};
use crate::auth::{AuthGate, CredentialProvider, GatePass};
use crate::config::SessionConfig;
use crate::error::{DerivError, Result};
use crate::types::{BalanceData, TickData, Topic};

/// Client for one Deriv websocket session. Cheap to clone; all clones share
/// the same socket, correlation table and subscriptions.
///
/// The session is established lazily on the first request, or eagerly via
/// [`connect`](Self::connect). Lost sessions reconnect in the background;
/// a [`SessionState::Failed`] client needs an explicit `connect` call.
#[derive(Clone)]
pub struct DerivClient {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    pub(super) config: SessionConfig,
    pub(super) credentials: Option<Arc<dyn CredentialProvider>>,
    pub(super) outbound: Arc<Outbound>,
    pub(super) correlator: Arc<Correlator>,
    pub(super) registry: Arc<Registry>,
    pub(super) gate: AuthGate,
    pub(super) cache: Arc<PriceCache>,
    pub(super) conn: Mutex<Option<Session>>,
    pub(super) state: watch::Sender<SessionState>,
    epoch: AtomicU64,
    deaths: mpsc::UnboundedSender<SessionDeath>,
    supervisor_boot: StdMutex<Option<mpsc::UnboundedReceiver<SessionDeath>>>,
}

impl DerivClient {
    pub fn new(config: SessionConfig) -> Self {
        Self::build(config, None)
    }

    pub fn with_credentials(
        config: SessionConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self::build(config, Some(credentials))
    }

    fn build(config: SessionConfig, credentials: Option<Arc<dyn CredentialProvider>>) -> Self {
        let outbound = Arc::new(Outbound::new());
        let correlator = Arc::new(Correlator::new(outbound.clone(), config.request_timeout));
        let registry = Arc::new(Registry::new(correlator.clone(), config.listener_buffer));
        let cache = Arc::new(PriceCache::new(config.price_history_cap));
        let (deaths_tx, deaths_rx) = mpsc::unbounded_channel();
        let (state_tx, _state_rx) = watch::channel(SessionState::Disconnected);

        Self {
            inner: Arc::new(ClientInner {
                config,
                credentials,
                outbound,
                correlator,
                registry,
                gate: AuthGate::new(),
                cache,
                conn: Mutex::new(None),
                state: state_tx,
                epoch: AtomicU64::new(0),
                deaths: deaths_tx,
                supervisor_boot: StdMutex::new(Some(deaths_rx)),
            }),
        }
    }

    /// Establish the session now instead of on first use. Also the way back
    /// from [`SessionState::Failed`]: it re-arms the gate and retries with
    /// whatever credentials the client holds.
    pub async fn connect(&self) -> Result<()> {
        if self.state().requires_manual_reconnect() {
            self.inner.gate.reset();
        }
        self.inner.boot_supervisor();
        let mut conn = self.inner.conn.lock().await;
        if conn.is_some() {
            return Ok(());
        }
        match self
            .inner
            .establish(&mut conn, SessionState::Disconnected)
            .await
        {
            Ok(()) => {
                self.inner.replay_subscriptions().await;
                Ok(())
            }
            Err(err) => Err(self.inner.fail_lazy_queue(err)),
        }
    }

    /// Close the session and fail everything in flight. Listener streams
    /// terminate; the client can connect again later.
    pub async fn close(&self) {
        self.inner.state.send_replace(SessionState::Closing);
        let session = self.inner.conn.lock().await.take();
        if let Some(session) = session {
            session.close().await;
        }
        self.inner.correlator.drain_all(|| DerivError::ConnectionLost);
        self.inner
            .gate
            .abort_pending(|| DerivError::ConnectionLost);
        // The next session must re-run the handshake before anything flows.
        self.inner.gate.close_gate();
        self.inner.registry.clear();
        self.inner.state.send_replace(SessionState::Disconnected);
        info!("client closed");
    }

    /// Send one request and await its reply, matched by id. Uses the
    /// configured request timeout.
    pub async fn submit(&self, payload: Value) -> Result<Value> {
        self.submit_with_timeout(payload, self.inner.config.request_timeout)
            .await
    }

    /// Like [`submit`](Self::submit) with an explicit deadline. On timeout
    /// the request outcome upstream is unknown; the session stays usable.
    pub async fn submit_with_timeout(&self, payload: Value, timeout: Duration) -> Result<Value> {
        self.ensure_connected().await?;
        match self.inner.gate.pass_or_defer(payload) {
            GatePass::Now { payload, epoch } => {
                self.inner
                    .correlator
                    .submit_with_timeout(payload, timeout, Some(epoch))
                    .await
            }
            GatePass::Deferred(released) => {
                let correlator = &self.inner.correlator;
                let reply = async move {
                    let (id, rx) = released
                        .await
                        .map_err(|_| DerivError::ConnectionLost)??;
                    correlator.await_reply(id, rx).await
                };
                match tokio::time::timeout(timeout, reply).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(?timeout, "queued request timed out");
                        Err(DerivError::Timeout { after: timeout })
                    }
                }
            }
            GatePass::Refused(err) => Err(err),
        }
    }

    /// Open a stream of pushes for a topic. Concurrent subscribers share one
    /// upstream subscription; each gets an independent stream.
    pub async fn subscribe(&self, topic: Topic) -> Result<TopicStream> {
        self.ensure_connected().await?;
        let epoch = self.inner.gate.await_ready().await?;
        self.inner.registry.subscribe(&topic, epoch).await
    }

    /// Detach one listener. The upstream subscription is torn down when the
    /// last listener for its topic goes away.
    pub async fn unsubscribe(&self, stream: TopicStream) -> Result<()> {
        self.inner.registry.unsubscribe(stream).await
    }

    /// Most recent tick seen for a symbol, from any source frame
    pub fn latest_price(&self, symbol: &str) -> Option<TickData> {
        self.inner.cache.latest(symbol)
    }

    /// Up to `limit` recent ticks for a symbol, oldest first
    pub fn price_history(&self, symbol: &str, limit: usize) -> Vec<TickData> {
        self.inner.cache.history(symbol, limit)
    }

    /// Most recent balance snapshot seen on any frame
    pub fn latest_balance(&self) -> Option<BalanceData> {
        self.inner.cache.latest_balance()
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Watch session state transitions, e.g. to detect `Failed`
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Lazy connect. A session that is connecting, authorizing or ready
    /// passes through; the gate handles ordering behind the handshake. A
    /// `Failed` session also passes, so the gate can refuse with the real
    /// terminal error.
    async fn ensure_connected(&self) -> Result<()> {
        if self.state() != SessionState::Disconnected {
            return Ok(());
        }
        self.inner.boot_supervisor();
        let mut conn = self.inner.conn.lock().await;
        if conn.is_some() || self.state() != SessionState::Disconnected {
            return Ok(());
        }
        self.inner
            .establish(&mut conn, SessionState::Disconnected)
            .await
            .map_err(|err| self.inner.fail_lazy_queue(err))
    }
}

impl ClientInner {
    /// Start the reconnect supervisor on first use. Must happen before the
    /// first session opens; `establish` itself cannot spawn it, because the
    /// supervisor awaits `establish` in turn.
    pub(super) fn boot_supervisor(self: &Arc<Self>) {
        if let Some(deaths_rx) = self.supervisor_boot.lock().unwrap().take() {
            tokio::spawn(supervisor::run(Arc::downgrade(self), deaths_rx));
        }
    }

    /// Open a socket and run the handshake. On success the session lands in
    /// `slot`, state is `Ready` and the gate has released its queue. On
    /// failure state falls back to `on_error`, except credential rejection
    /// which is terminal `Failed`.
    ///
    /// Caller must hold the `conn` lock.
    pub(super) async fn establish(
        self: &Arc<Self>,
        slot: &mut Option<Session>,
        on_error: SessionState,
    ) -> Result<()> {
        self.state.send_replace(SessionState::Connecting);
        let epoch = self.epoch.fetch_add(1, Ordering::Relaxed) + 1;
        self.correlator.reset_ids();

        let session = match Session::open(
            &self.config,
            epoch,
            self.outbound.clone(),
            self.correlator.clone(),
            self.registry.clone(),
            self.cache.clone(),
            self.deaths.clone(),
        )
        .await
        {
            Ok(session) => session,
            Err(err) => {
                self.state.send_replace(on_error);
                return Err(err);
            }
        };
        self.state.send_replace(SessionState::Connected);

        if let Some(credentials) = &self.credentials {
            self.state.send_replace(SessionState::Authorizing);
            let payload = match credentials.authorize_payload().await {
                Ok(payload) => payload,
                Err(err) => {
                    session.close().await;
                    self.state.send_replace(on_error);
                    return Err(err);
                }
            };
            match self.correlator.submit(payload).await {
                Ok(_account) => {}
                Err(DerivError::Upstream { code, message }) => {
                    warn!(%code, %message, "authorization rejected");
                    self.gate.reject(&code, &message);
                    session.close().await;
                    self.state.send_replace(SessionState::Failed);
                    return Err(DerivError::AuthRejected { code, message });
                }
                Err(err) => {
                    session.close().await;
                    self.state.send_replace(on_error);
                    return Err(err);
                }
            }
        }

        *slot = Some(session);
        self.state.send_replace(SessionState::Ready);
        self.gate.release(&self.correlator, epoch).await;
        info!(epoch, "session ready");
        Ok(())
    }

    /// A failed establish on the lazy-connect path has no supervisor behind
    /// it, so requests parked at the gate must not wait forever. Credential
    /// rejection already drained them.
    pub(super) fn fail_lazy_queue(&self, err: DerivError) -> DerivError {
        if !err.is_fatal() {
            self.gate.abort_pending(|| DerivError::NotConnected);
        }
        err
    }

    /// Re-issue upstream subscribes for every topic that still has
    /// listeners. Failures are logged; the affected topics simply stop
    /// receiving pushes until the next reconnect.
    pub(super) async fn replay_subscriptions(&self) {
        for topic in self.registry.topics_for_replay() {
            match self.correlator.submit(topic.subscribe_payload()).await {
                Ok(reply) => {
                    self.registry
                        .record_upstream(&topic, wire::subscription_id(&reply));
                    info!(%topic, "subscription replayed");
                }
                Err(err) => {
                    warn!(%topic, error = %err, "subscription replay failed");
                }
            }
        }
    }
}
