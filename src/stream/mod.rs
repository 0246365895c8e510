//! Realtime stream modules.
//!
//! - `client`: public handle plus the websocket worker that owns the socket,
//!   heartbeat, and reconnect timers.
//! - `lifecycle`: sans-IO connection state machine driving the worker.
//! - `proto`: liveness literals, the message envelope, and typed topics.
//! - `registry`: listener registry and isolated dispatch.

/// Client handle and connection worker.
pub mod client;
/// Connection state machine.
pub mod lifecycle;
/// Stream protocol messages.
pub mod proto;
/// Listener registry and dispatch policy.
pub mod registry;
