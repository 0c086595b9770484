/*
[INPUT]:  Request payloads from concurrent callers, decoded replies from the read loop
[OUTPUT]: Each caller resolved exactly once with its own reply, error or timeout
[POS]:    WebSocket layer - correlation between req_id and suspended callers
[UPDATE]: When the pending-request contract or id allocation changes
*/

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::session::Outbound;
use super::wire;
use crate::error::{DerivError, Result};

struct Waiter {
    tx: oneshot::Sender<Result<Value>>,
    submitted_at: DateTime<Utc>,
}

/// Tracks one pending waiter per outgoing request id.
///
/// Ids are monotonically increasing and scoped to a session: `reset_ids` runs
/// on every (re)connect, after `drain_all` has emptied the table, so an id
/// from a dead session can never match a reply on a new one.
pub(crate) struct Correlator {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, Waiter>>,
    outbound: std::sync::Arc<Outbound>,
    default_timeout: Duration,
}

impl Correlator {
    pub(crate) fn new(outbound: std::sync::Arc<Outbound>, default_timeout: Duration) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            outbound,
            default_timeout,
        }
    }

    /// Allocate an id and park a waiter for it
    pub(crate) fn register(&self) -> (u64, oneshot::Receiver<Result<Value>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(
            id,
            Waiter {
                tx,
                submitted_at: Utc::now(),
            },
        );
        (id, rx)
    }

    /// Tag the payload with the registered id and write it. With a scope the
    /// write only goes to the session with that epoch. The waiter is removed
    /// if the write fails.
    pub(crate) async fn send_registered(
        &self,
        id: u64,
        payload: Value,
        scope: Option<u64>,
    ) -> Result<()> {
        let frame = match wire::with_req_id(payload, id) {
            Ok(frame) => frame,
            Err(err) => {
                self.remove(id);
                return Err(err);
            }
        };
        if let Err(err) = self.outbound.send_json_scoped(&frame, scope).await {
            self.remove(id);
            // The session was open when the caller entered; a missing writer
            // here means it died underneath us.
            return Err(match err {
                DerivError::NotConnected => DerivError::ConnectionLost,
                other => other,
            });
        }
        Ok(())
    }

    /// Suspend until the reply arrives. Dropping the returned future removes
    /// the waiter, but cannot un-send an already-written frame.
    pub(crate) async fn await_reply(
        &self,
        id: u64,
        rx: oneshot::Receiver<Result<Value>>,
    ) -> Result<Value> {
        let _guard = PendingGuard {
            correlator: self,
            id,
        };
        rx.await.map_err(|_| DerivError::ConnectionLost)?
    }

    /// Submit on whatever session is current. Handshake, replay and forget
    /// traffic uses this.
    pub(crate) async fn submit(&self, payload: Value) -> Result<Value> {
        self.submit_with_timeout(payload, self.default_timeout, None)
            .await
    }

    /// Submit bound to the session that admitted the request; fails with
    /// `ConnectionLost` if that session has been replaced.
    pub(crate) async fn submit_scoped(&self, payload: Value, epoch: u64) -> Result<Value> {
        self.submit_with_timeout(payload, self.default_timeout, Some(epoch))
            .await
    }

    pub(crate) async fn submit_with_timeout(
        &self,
        payload: Value,
        timeout: Duration,
        scope: Option<u64>,
    ) -> Result<Value> {
        let (id, rx) = self.register();
        self.send_registered(id, payload, scope).await?;
        match tokio::time::timeout(timeout, self.await_reply(id, rx)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(id, ?timeout, "request timed out, outcome ambiguous");
                Err(DerivError::Timeout { after: timeout })
            }
        }
    }

    /// Deliver a reply to its waiter. Returns false for unknown or late ids,
    /// which are non-fatal.
    pub(crate) fn resolve(&self, id: u64, result: Result<Value>) -> bool {
        let waiter = self.pending.lock().unwrap().remove(&id);
        match waiter {
            Some(waiter) => {
                let elapsed = Utc::now() - waiter.submitted_at;
                debug!(id, elapsed_ms = elapsed.num_milliseconds(), "request resolved");
                let _ = waiter.tx.send(result);
                true
            }
            None => {
                warn!(id, "reply for unknown or late request id, discarding");
                false
            }
        }
    }

    /// Fail every outstanding waiter so no caller blocks forever. Called on
    /// session close or failure.
    pub(crate) fn drain_all(&self, make_error: impl Fn() -> DerivError) {
        let drained: Vec<Waiter> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().map(|(_, waiter)| waiter).collect()
        };
        if !drained.is_empty() {
            warn!(count = drained.len(), "draining pending requests");
        }
        for waiter in drained {
            let _ = waiter.tx.send(Err(make_error()));
        }
    }

    /// Restart id allocation for a fresh session. Only valid once the table
    /// has been drained.
    pub(crate) fn reset_ids(&self) {
        self.next_id.store(1, Ordering::Relaxed);
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    fn remove(&self, id: u64) -> bool {
        self.pending.lock().unwrap().remove(&id).is_some()
    }
}

/// Removes the waiter when a suspended caller goes away (timeout or drop).
/// Removal is idempotent: a waiter resolved normally is already gone.
struct PendingGuard<'a> {
    correlator: &'a Correlator,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.correlator.remove(self.id) {
            debug!(id = self.id, "pending request cancelled");
        }
    }
}
