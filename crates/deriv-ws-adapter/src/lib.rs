/*
[INPUT]:  Module exports
[OUTPUT]: Public crate surface
[POS]:    Crate root for the Deriv websocket adapter
[UPDATE]: When adding top-level modules or changing re-exports
*/

pub mod auth;
pub mod config;
pub mod error;
pub mod types;
pub mod ws;

pub use auth::{CredentialProvider, StaticToken};
pub use config::{BackoffConfig, DEFAULT_ENDPOINT, SessionConfig};
pub use error::{DerivError, Result};
pub use types::{BalanceData, TickData, Topic};
pub use ws::{DerivClient, PriceCache, SessionState, TopicStream};
