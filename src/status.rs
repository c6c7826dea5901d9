//! Externally observable connection status and diagnostic events.
//!
//! The status projection is what a UI indicator binds to; diagnostics are a
//! human-readable, category-tagged event stream for a connection log panel.

use serde::Serialize;

use crate::connection::machine::{ConnectionMachine, ConnectionState};

/// Coarse status for UI indicators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Online,
    Reconnecting,
    Error,
    Disconnected,
}

impl ConnectionStatus {
    pub fn from_state(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Idle => Self::Idle,
            ConnectionState::Connecting => Self::Connecting,
            ConnectionState::Connected(_) => Self::Online,
            ConnectionState::Reconnecting(_) => Self::Reconnecting,
            ConnectionState::Disconnected => Self::Disconnected,
            ConnectionState::Terminal(_) => Self::Error,
        }
    }
}

/// Structured projection of the machine, kept in sync with every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub status: ConnectionStatus,
    pub state: ConnectionState,
    pub reconnect_attempt: u32,
    pub next_retry_delay_ms: u64,
    /// Epoch millis at which the next reconnect attempt fires (countdown).
    pub reconnect_target_time: Option<u64>,
    pub last_error: Option<String>,
    /// Whether a backoff timer is currently armed.
    pub retry_pending: bool,
}

impl StatusSnapshot {
    pub fn project(machine: &ConnectionMachine, retry_pending: bool) -> Self {
        let context = machine.context();
        Self {
            status: ConnectionStatus::from_state(machine.state()),
            state: machine.state(),
            reconnect_attempt: context.reconnect_attempt,
            next_retry_delay_ms: context.next_retry_delay_ms,
            reconnect_target_time: context.reconnect_target_time,
            last_error: context.last_error.clone(),
            retry_pending,
        }
    }
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Idle,
            state: ConnectionState::Idle,
            reconnect_attempt: 0,
            next_retry_delay_ms: 0,
            reconnect_target_time: None,
            last_error: None,
            retry_pending: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticCategory {
    Connection,
    Reconnect,
    Verify,
    Sm,
    Proxy,
    Error,
}

impl DiagnosticCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Reconnect => "reconnect",
            Self::Verify => "verify",
            Self::Sm => "sm",
            Self::Proxy => "proxy",
            Self::Error => "error",
        }
    }
}

/// A single line for the connection diagnostics log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticEvent {
    pub timestamp_ms: u64,
    pub category: DiagnosticCategory,
    pub message: String,
}

/// User-facing notification kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NotificationKind {
    ResourceConflict,
    AuthenticationFailed,
    ReconnectFailed,
    FirewallSuspected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub message: String,
}

/// Current time as milliseconds since UNIX epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::machine::{BackoffPolicy, MachineEvent};

    #[test]
    fn test_projection_follows_machine() {
        let mut machine = ConnectionMachine::new(BackoffPolicy::default());
        assert_eq!(
            StatusSnapshot::project(&machine, false),
            StatusSnapshot::default()
        );

        machine.send(MachineEvent::Connect, 0);
        machine.send(MachineEvent::ConnectionSuccess, 0);
        assert_eq!(
            StatusSnapshot::project(&machine, false).status,
            ConnectionStatus::Online
        );

        machine.send(
            MachineEvent::SocketDied {
                reason: "closed".into(),
            },
            5_000,
        );
        let snapshot = StatusSnapshot::project(&machine, true);
        assert_eq!(snapshot.status, ConnectionStatus::Reconnecting);
        assert_eq!(snapshot.reconnect_attempt, 1);
        assert_eq!(snapshot.reconnect_target_time, Some(6_000));
        assert_eq!(snapshot.last_error.as_deref(), Some("closed"));
        assert!(snapshot.retry_pending);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&ConnectionStatus::Reconnecting).unwrap();
        assert_eq!(json, "\"reconnecting\"");
    }
}
