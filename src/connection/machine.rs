//! Connection state machine.
//!
//! Pure transition logic: no I/O, no timers. The orchestrator feeds events in
//! and reacts to the returned [`Transition`]s (scheduling the retry timer,
//! launching an attempt, tearing down a dead client).
//!
//! ```text
//!   idle ──CONNECT──▶ connecting ──SUCCESS──▶ connected.healthy ◀──VERIFY_SUCCESS── connected.verifying
//!                        │                      │  │  WAKE(short) ─────────────────────────▲
//!                  ERROR ▼                      │  └─SOCKET_DIED / WAKE(long)─┐             │
//!          terminal.initialFailure              │                             ▼   VERIFY_FAILED
//!                                               │                 reconnecting.waiting ◀───┘
//!                         CONFLICT / AUTH_ERROR │                  │   ▲
//!                                               ▼      RETRY_TIMER │   │ ERROR (attempts left)
//!                        terminal.conflict / terminal.authError    ▼   │
//!                                                     reconnecting.attempting ──ERROR (exhausted)──▶ terminal.maxRetries
//! ```

use std::time::Duration;

use serde::Serialize;

use crate::config::ConnectionConfig;

/// Sub-states of `connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectedState {
    Healthy,
    Verifying,
}

/// Sub-states of `reconnecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ReconnectingState {
    Waiting,
    Attempting,
}

/// Why the machine stopped for good (until a fresh `CONNECT`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TerminalReason {
    Conflict,
    AuthError,
    MaxRetries,
    InitialFailure,
}

/// The authoritative connection state. Exactly one value is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "state", content = "substate", rename_all = "camelCase")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected(ConnectedState),
    Reconnecting(ReconnectingState),
    Disconnected,
    Terminal(TerminalReason),
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected(ConnectedState::Healthy) => "connected.healthy",
            Self::Connected(ConnectedState::Verifying) => "connected.verifying",
            Self::Reconnecting(ReconnectingState::Waiting) => "reconnecting.waiting",
            Self::Reconnecting(ReconnectingState::Attempting) => "reconnecting.attempting",
            Self::Disconnected => "disconnected",
            Self::Terminal(TerminalReason::Conflict) => "terminal.conflict",
            Self::Terminal(TerminalReason::AuthError) => "terminal.authError",
            Self::Terminal(TerminalReason::MaxRetries) => "terminal.maxRetries",
            Self::Terminal(TerminalReason::InitialFailure) => "terminal.initialFailure",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected(_))
    }

    pub fn is_reconnecting(&self) -> bool {
        matches!(self, Self::Reconnecting(_))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal(_))
    }

    /// States a fresh user-initiated `CONNECT` may start from directly.
    fn accepts_connect(&self) -> bool {
        matches!(self, Self::Idle | Self::Disconnected | Self::Terminal(_))
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events accepted by the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineEvent {
    Connect,
    ConnectionSuccess,
    ConnectionError { reason: String },
    SocketDied { reason: String },
    /// System woke up after sleeping for the given duration.
    Wake { sleep_duration: Duration },
    VerifySuccess,
    VerifyFailed { reason: String },
    RetryTimerExpired,
    TriggerReconnect,
    CancelReconnect,
    Disconnect,
    Conflict,
    AuthError { reason: String },
}

impl MachineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::ConnectionSuccess => "CONNECTION_SUCCESS",
            Self::ConnectionError { .. } => "CONNECTION_ERROR",
            Self::SocketDied { .. } => "SOCKET_DIED",
            Self::Wake { .. } => "WAKE",
            Self::VerifySuccess => "VERIFY_SUCCESS",
            Self::VerifyFailed { .. } => "VERIFY_FAILED",
            Self::RetryTimerExpired => "RETRY_TIMER_EXPIRED",
            Self::TriggerReconnect => "TRIGGER_RECONNECT",
            Self::CancelReconnect => "CANCEL_RECONNECT",
            Self::Disconnect => "DISCONNECT",
            Self::Conflict => "CONFLICT",
            Self::AuthError { .. } => "AUTH_ERROR",
        }
    }
}

/// Mutable data carried alongside the state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineContext {
    /// Reconnect attempt number; 0 while healthy.
    pub reconnect_attempt: u32,
    /// Delay computed on the last entry into `reconnecting.waiting`.
    pub next_retry_delay_ms: u64,
    /// Wall-clock (epoch millis) at which the pending attempt fires.
    pub reconnect_target_time: Option<u64>,
    pub last_error: Option<String>,
}

/// Backoff timing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
    /// Sleep longer than this means the server-side SM session is gone.
    pub sm_timeout: Duration,
}

impl BackoffPolicy {
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            base_delay_ms: config.base_retry_delay_ms,
            max_delay_ms: config.max_retry_delay_ms,
            max_attempts: config.max_reconnect_attempts,
            sm_timeout: Duration::from_millis(config.sm_session_timeout_ms),
        }
    }

    /// `min(max, base * 2^(attempt-1))`, attempt starting at 1.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(63);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        self.base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&ConnectionConfig::default())
    }
}

/// A state change produced by [`ConnectionMachine::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub event: &'static str,
}

#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: ConnectionState,
    context: MachineContext,
    policy: BackoffPolicy,
}

impl ConnectionMachine {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            state: ConnectionState::Idle,
            context: MachineContext::default(),
            policy,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn context(&self) -> &MachineContext {
        &self.context
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Return to `idle` with a clean context.
    pub fn reset(&mut self) {
        self.state = ConnectionState::Idle;
        self.context = MachineContext::default();
    }

    /// Feed an event. Returns `None` when the current state ignores it.
    ///
    /// `now_ms` is the wall-clock used for the countdown target.
    pub fn send(&mut self, event: MachineEvent, now_ms: u64) -> Option<Transition> {
        use ConnectedState::*;
        use ConnectionState::*;
        use ReconnectingState::*;

        let from = self.state;
        let name = event.name();

        let to = match (from, event) {
            (s, MachineEvent::Connect) if s.accepts_connect() => {
                self.context = MachineContext::default();
                Connecting
            }

            (Connecting, MachineEvent::ConnectionSuccess) => {
                self.enter_healthy();
                Connected(Healthy)
            }
            (Connecting, MachineEvent::ConnectionError { reason }) => {
                self.context.last_error = Some(reason);
                Terminal(TerminalReason::InitialFailure)
            }

            (Connected(Healthy), MachineEvent::Wake { sleep_duration }) => {
                if sleep_duration > self.policy.sm_timeout {
                    self.enter_waiting(
                        format!(
                            "Session expired during {}s of sleep",
                            sleep_duration.as_secs()
                        ),
                        now_ms,
                    );
                    Reconnecting(Waiting)
                } else {
                    Connected(Verifying)
                }
            }
            (Connected(_), MachineEvent::SocketDied { reason }) => {
                self.enter_waiting(reason, now_ms);
                Reconnecting(Waiting)
            }
            (Connected(Verifying), MachineEvent::VerifySuccess) => Connected(Healthy),
            (Connected(Verifying), MachineEvent::VerifyFailed { reason }) => {
                self.enter_waiting(reason, now_ms);
                Reconnecting(Waiting)
            }

            (Reconnecting(Waiting), MachineEvent::RetryTimerExpired)
            | (Reconnecting(Waiting), MachineEvent::TriggerReconnect)
            | (Reconnecting(Waiting), MachineEvent::Wake { .. }) => {
                self.context.reconnect_target_time = None;
                Reconnecting(Attempting)
            }
            (Reconnecting(_), MachineEvent::CancelReconnect) => {
                self.context.reconnect_target_time = None;
                Disconnected
            }

            (Reconnecting(Attempting), MachineEvent::ConnectionSuccess) => {
                self.enter_healthy();
                Connected(Healthy)
            }
            (Reconnecting(Attempting), MachineEvent::ConnectionError { reason }) => {
                if self.context.reconnect_attempt >= self.policy.max_attempts {
                    self.context.last_error = Some(reason);
                    self.context.reconnect_target_time = None;
                    Terminal(TerminalReason::MaxRetries)
                } else {
                    self.enter_waiting(reason, now_ms);
                    Reconnecting(Waiting)
                }
            }

            (Connecting | Connected(_) | Reconnecting(_), MachineEvent::Conflict) => {
                self.context.last_error =
                    Some("Another client connected with the same resource".to_string());
                self.context.reconnect_target_time = None;
                Terminal(TerminalReason::Conflict)
            }
            (Connecting | Connected(_) | Reconnecting(_), MachineEvent::AuthError { reason }) => {
                self.context.last_error = Some(reason);
                self.context.reconnect_target_time = None;
                Terminal(TerminalReason::AuthError)
            }
            (Connecting | Connected(_) | Reconnecting(_), MachineEvent::Disconnect) => {
                self.context.reconnect_target_time = None;
                Disconnected
            }

            _ => return None,
        };

        self.state = to;
        Some(Transition {
            from,
            to,
            event: name,
        })
    }

    fn enter_healthy(&mut self) {
        self.context.reconnect_attempt = 0;
        self.context.next_retry_delay_ms = 0;
        self.context.reconnect_target_time = None;
        self.context.last_error = None;
    }

    /// Entry action of `reconnecting.waiting`.
    fn enter_waiting(&mut self, reason: String, now_ms: u64) {
        self.context.reconnect_attempt = self.context.reconnect_attempt.saturating_add(1);
        let delay = self.policy.delay_ms(self.context.reconnect_attempt);
        self.context.next_retry_delay_ms = delay;
        self.context.reconnect_target_time = Some(now_ms.saturating_add(delay));
        self.context.last_error = Some(reason);
    }
}
