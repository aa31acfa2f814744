//! Public types for the channel-mux crate.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::Serialize;
use tokio_tungstenite::tungstenite;

/// A boxed error type for caller-supplied callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A future that resolves to an opaque credential for the authentication frame.
pub type TokenFuture = Pin<Box<dyn Future<Output = Result<String, BoxError>> + Send>>;

/// Callback that produces a fresh credential for every connection attempt.
pub type TokenProvider = Box<dyn Fn() -> TokenFuture + Send + Sync>;

/// Connection state of a [`ConnectionManager`](crate::ConnectionManager).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    /// No transport and no pending reconnect.
    Disconnected,
    /// Opening the transport (initial attempt or scheduled reconnect).
    Connecting,
    /// Transport open, authentication frame sent, waiting for the ack.
    Connected,
    /// Handshake complete; channel traffic is dispatched to subscribers.
    Authenticated,
    /// The hub rejected the credential. Left only by an explicit `connect()`.
    AuthFailed,
    /// The last attempt failed. Terminal once the retry budget is spent.
    Error,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Authenticated => "authenticated",
            ConnectionState::AuthFailed => "auth-failed",
            ConnectionState::Error => "error",
        }
    }

    /// True while a session is opening, handshaking or serving traffic.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::Connected
                | ConnectionState::Authenticated
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle returned by every registration call.
///
/// Dropping the handle (or calling [`dispose`](Disposer::dispose)) removes
/// exactly the registration that produced it. Disposing twice is impossible,
/// and disposing after the manager is gone is a no-op.
#[must_use = "dropping a Disposer immediately removes the registration"]
pub struct Disposer {
    undo: Option<Box<dyn FnOnce() + Send>>,
}

impl Disposer {
    pub(crate) fn new(undo: impl FnOnce() + Send + 'static) -> Self {
        Self {
            undo: Some(Box::new(undo)),
        }
    }

    /// Remove the registration now.
    pub fn dispose(mut self) {
        if let Some(undo) = self.undo.take() {
            undo();
        }
    }
}

impl Drop for Disposer {
    fn drop(&mut self) {
        if let Some(undo) = self.undo.take() {
            undo();
        }
    }
}

impl fmt::Debug for Disposer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disposer")
            .field("armed", &self.undo.is_some())
            .finish()
    }
}

/// Errors returned by this crate.
///
/// Transport and protocol failures inside a running session never reach the
/// caller as values; they surface only through [`ConnectionState`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    #[error("token endpoint HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("token fetch failed: {0}")]
    TokenFetch(BoxError),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("config error: {0}")]
    Config(String),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no tokio runtime available")]
    NoRuntime,
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(e))
    }
}
