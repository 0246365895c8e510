//! Realtime event client for the trading bot dashboard backend.
//!
//! The crate is organized by concern:
//! - `stream`: websocket lifecycle, protocol types, and listener dispatch.
//! - `retry`: reconnect backoff policy and timeout helpers.
//! - `config`: client options and endpoint derivation.
//! - `error`: the crate error type.

/// Client options, defaults, and endpoint derivation.
pub mod config;
/// Crate error type.
pub mod error;
/// Reconnect backoff and timeout helpers.
pub mod retry;
/// Realtime stream client, protocol types, and listener dispatch.
pub mod stream;

pub use config::{RealtimeClientOptions, RealtimeDefaults};
pub use error::RealtimeError;
pub use retry::ReconnectPolicy;
pub use stream::client::RealtimeClient;
pub use stream::lifecycle::ConnectionState;
pub use stream::proto::{Envelope, KillSwitchTopic, LogEntry, LogTopic, Topic, ALL_TOPIC};
pub use stream::registry::Listener;
