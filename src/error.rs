use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

/// Errors produced by realtime client construction and transport handling.
///
/// Only construction hands these back to callers. Once the client is running,
/// the background worker logs them and keeps going.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// The API base URL could not be parsed.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),

    /// The API base URL uses a scheme with no websocket counterpart.
    #[error("unsupported endpoint scheme: {0}")]
    UnsupportedScheme(String),

    /// The client was created outside of a tokio runtime.
    #[error("no tokio runtime available to host the realtime worker")]
    NoRuntime,

    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// The websocket handshake did not finish in time.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
}
