/*
[INPUT]:  Credentials and the connect/authorize handshake outcome
[OUTPUT]: Strict connect -> authorize -> free-flow ordering for requests
[POS]:    Auth layer - credential provider seam and authorization gate
[UPDATE]: When the handshake flow or gating policy changes
*/

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{DerivError, Result};
use crate::ws::correlator::Correlator;

/// Supplies the authorize payload for the handshake. Implementations may
/// fetch or refresh tokens; the sequencer calls this on every (re)connect.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn authorize_payload(&self) -> Result<Value>;
}

/// A fixed API token
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticToken").field("token", &"***").finish()
    }
}

#[async_trait]
impl CredentialProvider for StaticToken {
    async fn authorize_payload(&self) -> Result<Value> {
        Ok(json!({ "authorize": self.token }))
    }
}

/// A request parked while the handshake is in flight. Its reply channel
/// receives either the registered waiter (request is on the wire) or the
/// terminal gate error.
pub(crate) struct DeferredSubmit {
    payload: Value,
    reply: oneshot::Sender<Result<(u64, oneshot::Receiver<Result<Value>>)>>,
}

pub(crate) enum GatePass {
    /// Gate is open; caller submits directly, scoped to the session that
    /// opened it
    Now { payload: Value, epoch: u64 },
    /// Parked until the gate resolves
    Deferred(oneshot::Receiver<Result<(u64, oneshot::Receiver<Result<Value>>)>>),
    Refused(DerivError),
}

enum GateState {
    /// Connect/authorize in flight; requests queue in submission order
    Pending {
        deferred: VecDeque<DeferredSubmit>,
        watchers: Vec<oneshot::Sender<Result<u64>>>,
    },
    /// Handshake done on the session with this epoch
    Open { epoch: u64 },
    /// Credentials rejected. Fatal: nothing passes until a manual reconnect
    /// with fixed credentials.
    Rejected { code: String, message: String },
    /// Reconnect budget exhausted
    Unavailable { attempts: u32 },
}

impl GateState {
    fn pending() -> Self {
        GateState::Pending {
            deferred: VecDeque::new(),
            watchers: Vec::new(),
        }
    }
}

/// Orders connect -> authorize -> free-flow. Requests submitted while the
/// handshake runs are queued and released strictly in submission order once
/// the session is Ready; after a rejection they fail without reaching the
/// wire.
pub(crate) struct AuthGate {
    state: Mutex<GateState>,
}

impl AuthGate {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(GateState::pending()),
        }
    }

    /// Synchronous gate decision for one request
    pub(crate) fn pass_or_defer(&self, payload: Value) -> GatePass {
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            GateState::Open { epoch } => GatePass::Now {
                payload,
                epoch: *epoch,
            },
            GateState::Pending { deferred, .. } => {
                let (tx, rx) = oneshot::channel();
                deferred.push_back(DeferredSubmit { payload, reply: tx });
                GatePass::Deferred(rx)
            }
            GateState::Rejected { code, message } => GatePass::Refused(DerivError::AuthRejected {
                code: code.clone(),
                message: message.clone(),
            }),
            GateState::Unavailable { attempts } => {
                GatePass::Refused(DerivError::ConnectionUnavailable {
                    attempts: *attempts,
                })
            }
        }
    }

    /// Suspend until the gate opens, returning the epoch of the session it
    /// opened on. Used by subscribe, which carries no payload to park.
    pub(crate) async fn await_ready(&self) -> Result<u64> {
        let rx = {
            let mut state = self.state.lock().unwrap();
            match &mut *state {
                GateState::Open { epoch } => return Ok(*epoch),
                GateState::Pending { watchers, .. } => {
                    let (tx, rx) = oneshot::channel();
                    watchers.push(tx);
                    rx
                }
                GateState::Rejected { code, message } => {
                    return Err(DerivError::AuthRejected {
                        code: code.clone(),
                        message: message.clone(),
                    });
                }
                GateState::Unavailable { attempts } => {
                    return Err(DerivError::ConnectionUnavailable {
                        attempts: *attempts,
                    });
                }
            }
        };
        rx.await.unwrap_or(Err(DerivError::ConnectionLost))
    }

    /// Open the gate for the session with the given epoch: put every queued
    /// request on the wire in submission order, then let new submissions
    /// flow directly.
    pub(crate) async fn release(&self, correlator: &Correlator, epoch: u64) {
        loop {
            let batch = {
                let mut state = self.state.lock().unwrap();
                match &mut *state {
                    GateState::Pending { deferred, watchers } => {
                        if deferred.is_empty() {
                            let watchers = std::mem::take(watchers);
                            *state = GateState::Open { epoch };
                            for watcher in watchers {
                                let _ = watcher.send(Ok(epoch));
                            }
                            return;
                        }
                        std::mem::take(deferred)
                    }
                    // Rejected/Unavailable can win a race against release;
                    // their drains already answered the queue.
                    _ => return,
                }
            };

            for submit in batch {
                let (id, rx) = correlator.register();
                match correlator
                    .send_registered(id, submit.payload, Some(epoch))
                    .await
                {
                    Ok(()) => {
                        if submit.reply.send(Ok((id, rx))).is_err() {
                            // Caller gave up while queued; the frame is out,
                            // drop the waiter.
                            debug!(id, "queued request cancelled before release");
                            correlator.resolve(id, Err(DerivError::ConnectionLost));
                        }
                    }
                    Err(err) => {
                        let _ = submit.reply.send(Err(err));
                    }
                }
            }
        }
    }

    /// Credentials were rejected: fail the queue and refuse until reset
    pub(crate) fn reject(&self, code: &str, message: &str) {
        let mut state = self.state.lock().unwrap();
        Self::drain_locked(&mut state, || DerivError::AuthRejected {
            code: code.to_owned(),
            message: message.to_owned(),
        });
        *state = GateState::Rejected {
            code: code.to_owned(),
            message: message.to_owned(),
        };
    }

    /// Retry budget exhausted: fail the queue and refuse until reset
    pub(crate) fn fail_unavailable(&self, attempts: u32) {
        let mut state = self.state.lock().unwrap();
        Self::drain_locked(&mut state, || DerivError::ConnectionUnavailable { attempts });
        *state = GateState::Unavailable { attempts };
    }

    /// Back to queueing for a reconnect handshake. Preserves an existing
    /// queue if the gate is already pending.
    pub(crate) fn close_gate(&self) {
        let mut state = self.state.lock().unwrap();
        if !matches!(*state, GateState::Pending { .. }) {
            *state = GateState::pending();
        }
    }

    /// Fail whatever is queued without changing terminal state. Used on
    /// explicit close.
    pub(crate) fn abort_pending(&self, make_error: impl Fn() -> DerivError) {
        let mut state = self.state.lock().unwrap();
        Self::drain_locked(&mut state, make_error);
    }

    /// Fresh pending gate for an explicit reconnect, clearing any terminal
    /// state.
    pub(crate) fn reset(&self) {
        *self.state.lock().unwrap() = GateState::pending();
    }

    pub(crate) fn is_open(&self) -> bool {
        matches!(*self.state.lock().unwrap(), GateState::Open { .. })
    }

    fn drain_locked(state: &mut GateState, make_error: impl Fn() -> DerivError) {
        if let GateState::Pending { deferred, watchers } = state {
            for submit in std::mem::take(deferred) {
                let _ = submit.reply.send(Err(make_error()));
            }
            for watcher in std::mem::take(watchers) {
                let _ = watcher.send(Err(make_error()));
            }
        }
    }
}
