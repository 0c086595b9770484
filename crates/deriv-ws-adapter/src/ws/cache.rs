/*
[INPUT]:  Every tick and balance frame seen by the read loop
[OUTPUT]: Latest price, bounded history per symbol, latest balance
[POS]:    WebSocket layer - passive market-data cache for consumers
[UPDATE]: When cached fields or retention policy change
*/

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::types::{BalanceData, TickData};

/// Last price and a bounded history ring per symbol, plus the last balance
/// snapshot. Filled by the read loop for any matching frame that passes
/// through the session, independent of listeners.
pub struct PriceCache {
    history_cap: usize,
    inner: Mutex<HashMap<String, VecDeque<TickData>>>,
    balance: Mutex<Option<BalanceData>>,
}

impl PriceCache {
    pub(crate) fn new(history_cap: usize) -> Self {
        Self {
            history_cap: history_cap.max(1),
            inner: Mutex::new(HashMap::new()),
            balance: Mutex::new(None),
        }
    }

    pub(crate) fn record(&self, tick: TickData) {
        let mut inner = self.inner.lock().unwrap();
        let history = inner.entry(tick.symbol.clone()).or_default();
        if history.len() == self.history_cap {
            history.pop_front();
        }
        history.push_back(tick);
    }

    pub(crate) fn record_balance(&self, balance: BalanceData) {
        *self.balance.lock().unwrap() = Some(balance);
    }

    /// Most recent balance snapshot, if any has been seen
    pub fn latest_balance(&self) -> Option<BalanceData> {
        self.balance.lock().unwrap().clone()
    }

    /// Most recent tick for a symbol, if any has been seen
    pub fn latest(&self, symbol: &str) -> Option<TickData> {
        self.inner
            .lock()
            .unwrap()
            .get(symbol)
            .and_then(|history| history.back().cloned())
    }

    /// Up to `limit` most recent ticks, oldest first
    pub fn history(&self, symbol: &str, limit: usize) -> Vec<TickData> {
        self.inner
            .lock()
            .unwrap()
            .get(symbol)
            .map(|history| {
                history
                    .iter()
                    .skip(history.len().saturating_sub(limit))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}
