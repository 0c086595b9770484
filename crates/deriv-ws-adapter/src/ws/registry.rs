/*
[INPUT]:  Topic subscriptions from callers, push frames from the read loop
[OUTPUT]: Deduplicated upstream subscriptions fanned out to listener streams
[POS]:    WebSocket layer - topic fan-out and upstream subscribe bookkeeping
[UPDATE]: When subscription lifecycle or delivery policy changes
*/

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use serde_json::{Value, json};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::correlator::Correlator;
use super::wire;
use crate::error::{DerivError, Result};
use crate::types::Topic;

/// A listener's view of one topic: a lazy, cancellable sequence of pushes
/// that never completes on its own. Backed by a bounded buffer; when the
/// buffer is full, frames are dropped for this listener only.
pub struct TopicStream {
    id: Uuid,
    topic: Topic,
    rx: mpsc::Receiver<Value>,
}

impl TopicStream {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Next push for this topic. Returns None only after the owning client
    /// is closed.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }
}

impl futures_util::Stream for TopicStream {
    type Item = Value;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Value>> {
        self.rx.poll_recv(cx)
    }
}

struct ListenerSlot {
    id: Uuid,
    tx: mpsc::Sender<Value>,
}

struct TopicEntry {
    upstream_id: Option<String>,
    listeners: Vec<ListenerSlot>,
}

enum TopicState {
    /// First subscriber is negotiating upstream; the watch flips when done
    Pending(watch::Receiver<bool>),
    Active(TopicEntry),
}

/// Fans out push frames to local listeners and keeps exactly one upstream
/// subscription alive per topic. Listener handles survive reconnection;
/// upstream subscription ids do not.
pub(crate) struct Registry {
    topics: Mutex<HashMap<Topic, TopicState>>,
    correlator: Arc<Correlator>,
    listener_buffer: usize,
}

impl Registry {
    pub(crate) fn new(correlator: Arc<Correlator>, listener_buffer: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            correlator,
            listener_buffer,
        }
    }

    /// Attach a listener, issuing the upstream subscribe only if this topic
    /// has none yet. The upstream call is scoped to the session with the
    /// given epoch. Fails without creating a listener if upstream refuses.
    pub(crate) async fn subscribe(&self, topic: &Topic, epoch: u64) -> Result<TopicStream> {
        loop {
            enum Step {
                Wait(watch::Receiver<bool>),
                Initiate(watch::Sender<bool>),
            }

            let step = {
                let mut topics = self.topics.lock().unwrap();
                match topics.get_mut(topic) {
                    Some(TopicState::Active(entry)) => {
                        return Ok(self.attach(entry, topic));
                    }
                    Some(TopicState::Pending(done)) => Step::Wait(done.clone()),
                    None => {
                        let (tx, rx) = watch::channel(false);
                        topics.insert(topic.clone(), TopicState::Pending(rx));
                        Step::Initiate(tx)
                    }
                }
            };

            match step {
                Step::Wait(mut done) => {
                    // Initiator flips the watch on success and failure both;
                    // either way we re-examine the table.
                    while !*done.borrow() {
                        if done.changed().await.is_err() {
                            break;
                        }
                    }
                }
                Step::Initiate(done) => {
                    let mut cleanup = PendingCleanup {
                        registry: self,
                        topic,
                        done: Some(done),
                    };
                    let outcome = self
                        .correlator
                        .submit_scoped(topic.subscribe_payload(), epoch)
                        .await;
                    let done = cleanup.done.take().expect("cleanup armed exactly once");

                    let mut topics = self.topics.lock().unwrap();
                    topics.remove(topic);
                    match outcome {
                        Ok(reply) => {
                            let upstream_id = wire::subscription_id(&reply);
                            if upstream_id.is_none() {
                                debug!(%topic, "subscribe reply carried no subscription id");
                            }
                            let mut entry = TopicEntry {
                                upstream_id,
                                listeners: Vec::new(),
                            };
                            let stream = self.attach(&mut entry, topic);
                            topics.insert(topic.clone(), TopicState::Active(entry));
                            drop(topics);
                            let _ = done.send(true);
                            info!(%topic, "subscribed upstream");
                            return Ok(stream);
                        }
                        Err(err) => {
                            drop(topics);
                            let _ = done.send(true);
                            warn!(%topic, error = %err, "upstream subscribe failed");
                            return Err(err);
                        }
                    }
                }
            }
        }
    }

    /// Detach one listener. The last listener for a topic tears down the
    /// upstream subscription too.
    pub(crate) async fn unsubscribe(&self, stream: TopicStream) -> Result<()> {
        let TopicStream { id, topic, rx } = stream;
        drop(rx);

        let forget_id = {
            let mut topics = self.topics.lock().unwrap();
            let now_empty = match topics.get_mut(&topic) {
                Some(TopicState::Active(entry)) => {
                    entry.listeners.retain(|listener| listener.id != id);
                    entry.listeners.is_empty()
                }
                _ => false,
            };
            if now_empty {
                match topics.remove(&topic) {
                    Some(TopicState::Active(entry)) => entry.upstream_id,
                    _ => None,
                }
            } else {
                None
            }
        };

        if let Some(sub_id) = forget_id {
            match self.correlator.submit(json!({ "forget": sub_id })).await {
                Ok(_) => info!(%topic, "unsubscribed upstream"),
                // A dead session voids upstream state on its own.
                Err(DerivError::NotConnected) | Err(DerivError::ConnectionLost) => {
                    debug!(%topic, "skipping upstream forget, session is gone");
                }
                Err(err) => {
                    warn!(%topic, error = %err, "upstream forget failed");
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Deliver a push to every listener of the topic. Never blocks: a full
    /// listener buffer drops the frame for that listener only, and closed
    /// listeners are pruned.
    pub(crate) fn on_push(&self, topic: &Topic, payload: Value) {
        let mut topics = self.topics.lock().unwrap();
        if let Some(TopicState::Active(entry)) = topics.get_mut(topic) {
            entry
                .listeners
                .retain(|listener| match listener.tx.try_send(payload.clone()) {
                    Ok(()) => true,
                    Err(TrySendError::Full(_)) => {
                        warn!(%topic, listener = %listener.id, "listener buffer full, dropping push");
                        true
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!(%topic, listener = %listener.id, "listener dropped, pruning");
                        false
                    }
                });
        }
    }

    /// Forget upstream subscription ids after a session death; local
    /// listeners stay attached and wait for replay.
    pub(crate) fn void_upstream(&self) {
        let mut topics = self.topics.lock().unwrap();
        for state in topics.values_mut() {
            if let TopicState::Active(entry) = state {
                entry.upstream_id = None;
            }
        }
    }

    /// Topics that still have live listeners and need an upstream subscribe
    /// on the new session. Topics whose listeners all went away are dropped.
    pub(crate) fn topics_for_replay(&self) -> Vec<Topic> {
        let mut topics = self.topics.lock().unwrap();
        topics.retain(|_, state| match state {
            TopicState::Active(entry) => {
                entry.listeners.retain(|listener| !listener.tx.is_closed());
                !entry.listeners.is_empty()
            }
            TopicState::Pending(_) => true,
        });
        topics
            .iter()
            .filter_map(|(topic, state)| match state {
                TopicState::Active(_) => Some(topic.clone()),
                TopicState::Pending(_) => None,
            })
            .collect()
    }

    pub(crate) fn record_upstream(&self, topic: &Topic, upstream_id: Option<String>) {
        let mut topics = self.topics.lock().unwrap();
        if let Some(TopicState::Active(entry)) = topics.get_mut(topic) {
            entry.upstream_id = upstream_id;
        }
    }

    /// Tear down all topic state; listener streams terminate. Used on
    /// explicit client close.
    pub(crate) fn clear(&self) {
        self.topics.lock().unwrap().clear();
    }

    pub(crate) fn listener_count(&self, topic: &Topic) -> usize {
        match self.topics.lock().unwrap().get(topic) {
            Some(TopicState::Active(entry)) => entry.listeners.len(),
            _ => 0,
        }
    }

    fn attach(&self, entry: &mut TopicEntry, topic: &Topic) -> TopicStream {
        let (tx, rx) = mpsc::channel(self.listener_buffer);
        let id = Uuid::new_v4();
        entry.listeners.push(ListenerSlot { id, tx });
        TopicStream {
            id,
            topic: topic.clone(),
            rx,
        }
    }
}

/// Removes a Pending marker if the initiating subscribe is cancelled before
/// it resolved, so waiting subscribers can take over instead of spinning on
/// a dead entry.
struct PendingCleanup<'a> {
    registry: &'a Registry,
    topic: &'a Topic,
    done: Option<watch::Sender<bool>>,
}

impl Drop for PendingCleanup<'_> {
    fn drop(&mut self) {
        if let Some(done) = self.done.take() {
            let mut topics = self.registry.topics.lock().unwrap();
            if matches!(topics.get(self.topic), Some(TopicState::Pending(_))) {
                topics.remove(self.topic);
            }
            drop(topics);
            let _ = done.send(true);
        }
    }
}
