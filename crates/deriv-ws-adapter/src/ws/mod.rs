/*
[INPUT]:  Submodule exports
[OUTPUT]: WebSocket layer surface
[POS]:    Module root for session, correlation, subscriptions and reconnect
[UPDATE]: When adding or removing websocket submodules
*/

pub mod cache;
pub mod client;
pub(crate) mod correlator;
pub mod registry;
pub mod session;
pub(crate) mod supervisor;
pub(crate) mod wire;

pub use cache::PriceCache;
pub use client::DerivClient;
pub use registry::TopicStream;
pub use session::SessionState;
