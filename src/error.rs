//! Caller-facing error taxonomy.
//!
//! Only terminal failures (conflict, authentication), exhausted retries and
//! initial-connection failures ever surface here. Transient socket deaths and
//! best-effort storage/proxy/discovery failures stay inside the state machine
//! and the log stream.

use thiserror::Error;

pub type ConnectionResult<T> = Result<T, ConnectionError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Another client bound the same resource; credentials have been cleared.
    #[error("resource conflict: another client connected with the same resource")]
    Conflict,

    /// The server rejected the credentials; credentials have been cleared.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The first connection of a session failed. No automatic retry happens.
    #[error("connection failed: {0}")]
    InitialFailure(String),

    /// Automatic reconnection gave up.
    #[error("reconnection failed after {0} attempts")]
    MaxRetries(u32),

    /// `disconnect()` or `cancel_reconnect()` ended the pending operation.
    #[error("disconnected")]
    Disconnected,

    /// A newer `connect()` call replaced this one.
    #[error("connect superseded by a newer connect call")]
    Superseded,

    #[error("not connected")]
    NotConnected,

    #[error("transport error: {0}")]
    Transport(String),

    /// The orchestrator task is gone (runtime shut down).
    #[error("connection task stopped")]
    Stopped,
}

impl ConnectionError {
    /// Whether the user must re-enter credentials (as opposed to "retry now").
    pub fn requires_credentials(&self) -> bool {
        matches!(self, Self::Conflict | Self::AuthenticationFailed(_))
    }
}

/// Coarse classification of a transport-level stream error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorKind {
    /// `<conflict/>`: another session took our resource.
    Conflict,
    /// SASL failure or account problem.
    Authentication,
    /// Server is going away (`system-shutdown`, `reset`): reconnect proactively.
    ServerShutdown,
    /// The socket itself is unusable.
    DeadTransport,
    Other,
}

impl StreamErrorKind {
    /// Classify a stream/transport error by its message content.
    pub fn classify(reason: &str) -> Self {
        let lower = reason.to_ascii_lowercase();

        if lower.contains("conflict") {
            return Self::Conflict;
        }
        if [
            "not-authorized",
            "sasl",
            "authentication failed",
            "credentials-expired",
            "account-disabled",
        ]
        .iter()
        .any(|p| lower.contains(p))
        {
            return Self::Authentication;
        }
        let socket_reset = lower.contains("econnreset") || lower.contains("connection reset");
        if lower.contains("system-shutdown") || (lower.contains("reset") && !socket_reset) {
            return Self::ServerShutdown;
        }
        if [
            "econnreset",
            "connection reset",
            "broken pipe",
            "epipe",
            "socket.write",
            "socket not available",
            "websocket is not open",
            "not connected",
        ]
        .iter()
        .any(|p| lower.contains(p))
        {
            return Self::DeadTransport;
        }
        Self::Other
    }
}
