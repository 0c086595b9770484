/*
[INPUT]:  Topic identifiers and raw push payloads
[OUTPUT]: Typed stream topics and market data structs
[POS]:    Types layer - shared data model for subscriptions and ticks
[UPDATE]: When adding new stream topics or payload fields
*/

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// A logical stream identifier. Many local listeners can share one upstream
/// subscription per topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Live tick feed for one symbol
    Ticks(String),
    /// Account balance updates
    Balance,
}

impl Topic {
    pub fn ticks(symbol: impl Into<String>) -> Self {
        Topic::Ticks(symbol.into())
    }

    /// Upstream subscribe request for this topic (before req_id injection)
    pub fn subscribe_payload(&self) -> Value {
        match self {
            Topic::Ticks(symbol) => json!({ "ticks": symbol, "subscribe": 1 }),
            Topic::Balance => json!({ "balance": 1, "subscribe": 1 }),
        }
    }

    /// Classify an incoming push frame by its `msg_type` discriminator.
    pub(crate) fn from_push(msg_type: &str, payload: &Value) -> Option<Topic> {
        match msg_type {
            "tick" => payload
                .get("tick")
                .and_then(|tick| tick.get("symbol"))
                .and_then(Value::as_str)
                .map(Topic::ticks),
            "balance" => Some(Topic::Balance),
            _ => None,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Ticks(symbol) => write!(f, "ticks:{symbol}"),
            Topic::Balance => write!(f, "balance"),
        }
    }
}

/// One tick of a symbol's price feed
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TickData {
    pub symbol: String,
    pub quote: Decimal,
    #[serde(default)]
    pub bid: Option<Decimal>,
    #[serde(default)]
    pub ask: Option<Decimal>,
    pub epoch: i64,
}

impl TickData {
    pub fn time(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.epoch, 0).single()
    }
}

/// Account balance snapshot pushed by the venue
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BalanceData {
    pub balance: Decimal,
    pub currency: String,
}
