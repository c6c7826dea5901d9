//! Connection policy configuration.
//!
//! Every timing value the connection core uses lives here so hosts can tune
//! them (or load them from a JSON file) without touching the state machine.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunable policy values for the connection core.
///
/// All durations are stored in milliseconds (or seconds where the protocol
/// uses seconds) so the struct round-trips through JSON unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// First reconnect delay; doubled for each further attempt.
    pub base_retry_delay_ms: u64,
    /// Upper bound for the reconnect delay.
    pub max_retry_delay_ms: u64,
    /// Failed reconnect attempts tolerated before giving up.
    pub max_reconnect_attempts: u32,
    /// Sleep duration beyond which the server has certainly dropped the
    /// SM session, so verification is skipped on wake.
    pub sm_session_timeout_ms: u64,
    /// Age after which persisted SM state is no longer worth resuming.
    pub sm_state_max_age_ms: u64,
    /// Default bound for `verify_connection`.
    pub verify_timeout_ms: u64,
    /// Bound for a single connect/reconnect handshake.
    pub attempt_timeout_ms: u64,
    /// Bound for the host-meta WebSocket discovery lookup.
    pub discovery_timeout_ms: u64,
    /// Bound for each best-effort step of `disconnect()` cleanup.
    pub cleanup_step_timeout_ms: u64,
    /// Window in which outgoing SM acknowledgements are coalesced.
    pub ack_debounce_ms: u64,
    /// Resumption window requested from the server (`max` attribute).
    pub sm_preferred_maximum_secs: u32,
    /// How often the transport asks the server for an acknowledgement.
    pub request_ack_interval_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            base_retry_delay_ms: 1_000,
            max_retry_delay_ms: 120_000,
            max_reconnect_attempts: 10,
            sm_session_timeout_ms: 600_000,
            sm_state_max_age_ms: 600_000,
            verify_timeout_ms: 10_000,
            attempt_timeout_ms: 30_000,
            discovery_timeout_ms: 5_000,
            cleanup_step_timeout_ms: 2_000,
            ack_debounce_ms: 250,
            sm_preferred_maximum_secs: 600,
            request_ack_interval_ms: 30_000,
        }
    }
}

impl ConnectionConfig {
    /// Load a configuration from a JSON file. Missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config {}: {}", path.display(), e))?;
        Self::from_json(&text)
            .map_err(|e| format!("Failed to parse config {}: {}", path.display(), e))
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_millis(self.verify_timeout_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn cleanup_step_timeout(&self) -> Duration {
        Duration::from_millis(self.cleanup_step_timeout_ms)
    }

    pub fn sm_state_max_age(&self) -> Duration {
        Duration::from_millis(self.sm_state_max_age_ms)
    }

    pub fn ack_debounce(&self) -> Duration {
        Duration::from_millis(self.ack_debounce_ms)
    }
}
