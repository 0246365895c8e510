//! Client options and websocket endpoint derivation.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use url::Url;

use crate::error::RealtimeError;
use crate::retry::ReconnectPolicy;

/// API base used when talking to a locally running backend.
pub const LOCAL_API_BASE_URL: &str = "http://localhost:8000";
/// Environment variable consulted by [`crate::RealtimeClient::from_env`].
pub const API_BASE_URL_ENV: &str = "BOTDASH_API_BASE_URL";

const LOG_STREAM_SEGMENTS: [&str; 2] = ["ws", "logs"];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RealtimeDefaults;

impl RealtimeDefaults {
    pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
    pub const INITIAL_BACKOFF: Duration = Duration::from_millis(1_000);
    pub const MAX_BACKOFF: Duration = Duration::from_millis(30_000);
    pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
}

#[derive(Clone, Debug)]
pub struct RealtimeClientOptions {
    /// Period of the outbound liveness probe while the connection is open.
    pub heartbeat_interval: Duration,
    pub reconnect_policy: ReconnectPolicy,
    /// Upper bound for a single websocket handshake.
    pub connect_timeout: Duration,
}

impl Default for RealtimeClientOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: RealtimeDefaults::HEARTBEAT_INTERVAL,
            reconnect_policy: ReconnectPolicy::dashboard(),
            connect_timeout: RealtimeDefaults::CONNECT_TIMEOUT,
        }
    }
}

/// Websocket base derived from the REST API base URL.
///
/// `http` maps to `ws` and `https` to `wss`. A trailing `/api` segment is
/// dropped because the log stream is mounted next to the REST API, not
/// under it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    base: Url,
}

impl Endpoint {
    pub fn parse(api_base: &str) -> Result<Self, RealtimeError> {
        let mut url = Url::parse(api_base.trim())?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => return Err(RealtimeError::UnsupportedScheme(other.to_string())),
        };
        url.set_scheme(scheme)
            .map_err(|_| RealtimeError::UnsupportedScheme(url.scheme().to_string()))?;

        let path = url.path().trim_end_matches('/');
        let path = path.strip_suffix("/api").unwrap_or(path).to_string();
        url.set_path(&path);
        url.set_query(None);
        url.set_fragment(None);

        Ok(Self { base: url })
    }

    /// Host (and port, when explicit) the stream connects to.
    pub fn authority(&self) -> String {
        match (self.base.host_str(), self.base.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            _ => String::new(),
        }
    }

    /// Full log-stream URL for `credential`.
    ///
    /// The credential is pushed as a single path segment, so reserved
    /// characters are percent-encoded rather than altering the path.
    pub fn url_for(&self, credential: &SecretString) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(LOG_STREAM_SEGMENTS)
                .push(credential.expose_secret());
        }
        url
    }
}
