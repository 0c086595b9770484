/*
[INPUT]:  Death notifications from socket tasks
[OUTPUT]: Replacement sessions with replayed subscriptions, or a Failed client
[POS]:    WebSocket layer - background reconnect driver
[UPDATE]: When retry policy or replay behavior changes
*/

use std::sync::{Arc, Weak};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::client::ClientInner;
use super::session::{SessionDeath, SessionState};
use crate::error::DerivError;

/// Reconnect loop for one client. Runs until every client handle is dropped
/// or the death channel closes.
pub(super) async fn run(inner: Weak<ClientInner>, mut deaths: mpsc::UnboundedReceiver<SessionDeath>) {
    while let Some(death) = deaths.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        handle_death(&inner, death).await;
    }
}

/// React to one session death. Stale or expected deaths are dropped; a death
/// of the live session triggers backoff-and-retry up to the attempt budget.
/// The `conn` lock is never held across a backoff sleep, so `close()` and
/// `connect()` stay responsive while we wait.
async fn handle_death(inner: &Arc<ClientInner>, death: SessionDeath) {
    {
        let mut conn = inner.conn.lock().await;

        // Only the session currently installed can trigger a reconnect.
        // Deaths from closed or already-replaced sessions are late news.
        match conn.as_ref() {
            Some(session) if session.epoch() == death.epoch => {}
            _ => {
                debug!(epoch = death.epoch, "ignoring stale session death");
                return;
            }
        }
        if owner_took_over(inner) {
            return;
        }

        warn!(epoch = death.epoch, reason = ?death.reason, "session lost, reconnecting");
        if let Some(session) = conn.take() {
            session.close().await;
        }
        inner.state.send_replace(SessionState::Connecting);
        inner.gate.close_gate();
        inner.correlator.drain_all(|| DerivError::ConnectionLost);
        inner.registry.void_upstream();
    }

    let backoff = inner.config.backoff.clone();
    for attempt in 1..=backoff.max_attempts {
        let delay = backoff.delay_for(attempt);
        debug!(attempt, ?delay, "reconnect backoff");
        tokio::time::sleep(delay).await;

        // The owner may have closed or reconnected the client while we
        // slept without the lock.
        let mut conn = inner.conn.lock().await;
        if owner_took_over(inner) || conn.is_some() {
            return;
        }

        match inner.establish(&mut conn, SessionState::Connecting).await {
            Ok(()) => {
                info!(attempt, "reconnected");
                inner.replay_subscriptions().await;
                return;
            }
            Err(err) if err.is_fatal() => {
                // Credential rejection; establish already moved to Failed
                // and poisoned the gate.
                return;
            }
            Err(err) => {
                warn!(attempt, error = %err, "reconnect attempt failed");
            }
        }
    }

    let conn = inner.conn.lock().await;
    if owner_took_over(inner) || conn.is_some() {
        return;
    }
    warn!(
        attempts = backoff.max_attempts,
        "reconnect budget exhausted, manual connect required"
    );
    inner.gate.fail_unavailable(backoff.max_attempts);
    inner.state.send_replace(SessionState::Failed);
}

/// True when an explicit `close()` or a competing `connect()` has taken the
/// lifecycle out of the supervisor's hands.
fn owner_took_over(inner: &ClientInner) -> bool {
    matches!(
        *inner.state.borrow(),
        SessionState::Closing | SessionState::Disconnected
    )
}
