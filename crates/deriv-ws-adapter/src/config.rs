/*
[INPUT]:  Endpoint, timeout and backoff settings
[OUTPUT]: Validated session configuration with sane defaults
[POS]:    Configuration layer - tunables for session, correlator and supervisor
[UPDATE]: When adding connection options or changing defaults
*/

use std::time::Duration;

use rand::Rng;
use url::Url;

use crate::error::Result;

/// Default Deriv WebSocket endpoint (app_id query required by the venue)
pub const DEFAULT_ENDPOINT: &str = "wss://ws.binaryws.com/websockets/v3";

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Full WebSocket URL, including the `app_id` query parameter
    pub endpoint: Url,
    /// Default deadline for `submit` when the caller does not pass one
    pub request_timeout: Duration,
    /// Interval between keepalive pings on an otherwise idle socket
    pub keepalive_interval: Duration,
    /// Capacity of the single-writer outbound queue
    pub outbound_capacity: usize,
    /// Per-listener push buffer; a full buffer drops frames for that
    /// listener only
    pub listener_buffer: usize,
    /// Ticks retained per symbol in the price cache
    pub price_history_cap: usize,
    pub backoff: BackoffConfig,
}

impl SessionConfig {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            request_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(30),
            outbound_capacity: 64,
            listener_buffer: 256,
            price_history_cap: 1000,
            backoff: BackoffConfig::default(),
        }
    }

    /// Build a config for the default endpoint with the given Deriv app id
    pub fn for_app_id(app_id: &str) -> Result<Self> {
        let mut endpoint = Url::parse(DEFAULT_ENDPOINT)?;
        endpoint.query_pairs_mut().append_pair("app_id", app_id);
        Ok(Self::new(endpoint))
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Reconnection backoff schedule: exponential, capped, jittered, with a
/// bounded number of consecutive attempts.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Fractional jitter applied to each delay, e.g. 0.2 for +/-20%
    pub jitter: f64,
    /// Consecutive failed attempts before the supervisor gives up
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: 5,
        }
    }
}

impl BackoffConfig {
    /// Delay before the given attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.initial.as_millis() as f64
            * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = exp.min(self.max.as_millis() as f64);
        let spread = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(-self.jitter..=self.jitter)
        } else {
            0.0
        };
        Duration::from_millis((capped * (1.0 + spread)).max(0.0) as u64)
    }
}
