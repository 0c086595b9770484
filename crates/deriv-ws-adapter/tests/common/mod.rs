/*
[INPUT]:  Websocket connections from the client under test
[OUTPUT]: Scripted venue replies, pushes and failure injection
[POS]:    Test support - in-process mock venue
[UPDATE]: When tests need new venue behaviors
*/
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, mpsc};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

pub const VALID_TOKEN: &str = "test-token-ok";

/// Scriptable stand-in for the venue. Accepts websocket connections, answers
/// the request verbs the adapter uses, and records what it saw.
pub struct MockVenue {
    addr: SocketAddr,
    state: Arc<VenueState>,
}

struct VenueState {
    auth_delay: Mutex<Option<Duration>>,
    refuse_new: AtomicBool,
    connections: AtomicU64,
    app_pings: AtomicU64,
    ws_pings: AtomicU64,
    forget_calls: AtomicU64,
    next_sub: AtomicU64,
    subscribe_calls: Mutex<HashMap<String, u64>>,
    arrivals: Mutex<Vec<Value>>,
    push_slot: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    kill: Notify,
}

impl MockVenue {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(VenueState {
            auth_delay: Mutex::new(None),
            refuse_new: AtomicBool::new(false),
            connections: AtomicU64::new(0),
            app_pings: AtomicU64::new(0),
            ws_pings: AtomicU64::new(0),
            forget_calls: AtomicU64::new(0),
            next_sub: AtomicU64::new(0),
            subscribe_calls: Mutex::new(HashMap::new()),
            arrivals: Mutex::new(Vec::new()),
            push_slot: Mutex::new(None),
            kill: Notify::new(),
        });

        let accept_state = state.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                if accept_state.refuse_new.load(Ordering::Relaxed) {
                    drop(stream);
                    continue;
                }
                accept_state.connections.fetch_add(1, Ordering::Relaxed);
                tokio::spawn(serve(stream, accept_state.clone()));
            }
        });

        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Delay the authorize reply to widen the handshake window
    pub fn set_auth_delay(&self, delay: Duration) {
        *self.state.auth_delay.lock().unwrap() = Some(delay);
    }

    /// Drop all future connection attempts at the TCP level
    pub fn refuse_new_connections(&self) {
        self.state.refuse_new.store(true, Ordering::Relaxed);
    }

    /// Accept connections again after `refuse_new_connections`
    pub fn allow_new_connections(&self) {
        self.state.refuse_new.store(false, Ordering::Relaxed);
    }

    /// Kill the current connection without a close handshake
    pub fn drop_connection(&self) {
        self.state.kill.notify_one();
    }

    /// Push a tick frame to the connected client
    pub fn push_tick(&self, symbol: &str, quote: f64) {
        let frame = json!({
            "msg_type": "tick",
            "tick": { "symbol": symbol, "quote": quote, "epoch": 1_700_000_100 },
        });
        if let Some(tx) = self.state.push_slot.lock().unwrap().as_ref() {
            let _ = tx.send(Message::Text(frame.to_string().into()));
        }
    }

    /// Send an arbitrary text frame to the connected client
    pub fn send_raw(&self, text: &str) {
        if let Some(tx) = self.state.push_slot.lock().unwrap().as_ref() {
            let _ = tx.send(Message::Text(text.to_owned().into()));
        }
    }

    pub fn connections(&self) -> u64 {
        self.state.connections.load(Ordering::Relaxed)
    }

    pub fn app_pings(&self) -> u64 {
        self.state.app_pings.load(Ordering::Relaxed)
    }

    /// Websocket-level ping frames received, across all connections
    pub fn ws_pings(&self) -> u64 {
        self.state.ws_pings.load(Ordering::Relaxed)
    }

    pub fn forget_calls(&self) -> u64 {
        self.state.forget_calls.load(Ordering::Relaxed)
    }

    /// How many subscribe requests arrived for a topic key such as
    /// "ticks:R_50" or "balance"
    pub fn subscribe_calls(&self, key: &str) -> u64 {
        self.state
            .subscribe_calls
            .lock()
            .unwrap()
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Every request frame received, in arrival order
    pub fn arrivals(&self) -> Vec<Value> {
        self.state.arrivals.lock().unwrap().clone()
    }
}

async fn serve(stream: TcpStream, state: Arc<VenueState>) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    let (push_tx, mut push_rx) = mpsc::unbounded_channel();
    *state.push_slot.lock().unwrap() = Some(push_tx);
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            _ = state.kill.notified() => break,
            Some(frame) = push_rx.recv() => {
                if write.send(frame).await.is_err() {
                    break;
                }
            }
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Some(reply) = respond(&state, text.as_str()).await
                        && write
                            .send(Message::Text(reply.to_string().into()))
                            .await
                            .is_err()
                    {
                        break;
                    }
                }
                Some(Ok(Message::Ping(_))) => {
                    // tungstenite answers the pong itself; just count it.
                    state.ws_pings.fetch_add(1, Ordering::Relaxed);
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    }
}

async fn respond(state: &VenueState, text: &str) -> Option<Value> {
    let request: Value = serde_json::from_str(text).ok()?;
    state.arrivals.lock().unwrap().push(request.clone());
    let req_id = request.get("req_id").cloned().unwrap_or(Value::Null);
    let passthrough = request.get("passthrough").cloned();

    let mut reply = if let Some(token) = request.get("authorize") {
        let delay = *state.auth_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if token == &json!(VALID_TOKEN) {
            json!({
                "msg_type": "authorize",
                "authorize": { "loginid": "CR123456", "currency": "USD" },
            })
        } else {
            json!({
                "msg_type": "authorize",
                "error": { "code": "InvalidToken", "message": "The token is invalid." },
            })
        }
    } else if request.get("ping").is_some() {
        state.app_pings.fetch_add(1, Ordering::Relaxed);
        json!({ "msg_type": "ping", "ping": "pong" })
    } else if let Some(symbol) = request.get("ticks").and_then(Value::as_str) {
        record_subscribe(state, &format!("ticks:{symbol}"));
        json!({
            "msg_type": "tick",
            "tick": { "symbol": symbol, "quote": 100.5, "epoch": 1_700_000_000 },
            "subscription": { "id": next_sub_id(state) },
        })
    } else if request.get("balance").is_some() {
        record_subscribe(state, "balance");
        json!({
            "msg_type": "balance",
            "balance": { "balance": 1000.0, "currency": "USD" },
            "subscription": { "id": next_sub_id(state) },
        })
    } else if request.get("forget").is_some() {
        state.forget_calls.fetch_add(1, Ordering::Relaxed);
        json!({ "msg_type": "forget", "forget": 1 })
    } else if request.get("block").is_some() {
        // Scripted black hole: the reply never comes.
        return None;
    } else {
        json!({
            "error": { "code": "UnrecognisedRequest", "message": "Unrecognised request." },
        })
    };

    reply["req_id"] = req_id;
    if let Some(passthrough) = passthrough {
        reply["passthrough"] = passthrough;
    }
    Some(reply)
}

fn record_subscribe(state: &VenueState, key: &str) {
    *state
        .subscribe_calls
        .lock()
        .unwrap()
        .entry(key.to_owned())
        .or_insert(0) += 1;
}

fn next_sub_id(state: &VenueState) -> String {
    format!("sub-{}", state.next_sub.fetch_add(1, Ordering::Relaxed) + 1)
}
