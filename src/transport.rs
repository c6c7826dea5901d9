//! Transport client abstraction.
//!
//! The wire library (XML parsing, WebSocket framing, SASL) sits behind
//! [`TransportClient`]. The connection core only needs start/send/stop, a
//! forceful destroy for dead sockets, the XEP-0198 surface, and a stream of
//! [`TransportEvent`]s tagged with the generation of the client that emitted
//! them.
//!
//! [`AckDebouncer`] and [`OutboundQueue`] are building blocks for transport
//! implementations: they coalesce outgoing `<a/>` acknowledgements and keep
//! the unacknowledged outbound queue consistent even when the server's `h`
//! runs ahead of what we queued.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::ConnectionConfig;
use crate::connection::{Command, ConnectOptions};

/// Stream-management resumption token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmState {
    /// Opaque SM session id from `<enabled id=…/>`.
    pub id: String,
    /// Count of inbound stanzas we have handled (`h` we report).
    pub inbound: u32,
}

/// Live XEP-0198 state reported by a transport client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SmStatus {
    pub id: Option<String>,
    pub inbound: u32,
    pub enabled: bool,
    /// Resumption window granted by the server, in seconds.
    pub max: Option<u32>,
    pub preferred_maximum: u32,
    pub request_ack_interval_ms: u64,
}

impl SmStatus {
    /// The resumption token, if the server handed us a non-empty SM id.
    pub fn resumable_state(&self) -> Option<SmState> {
        match self.id.as_deref() {
            Some(id) if !id.is_empty() => Some(SmState {
                id: id.to_string(),
                inbound: self.inbound,
            }),
            _ => None,
        }
    }
}

/// Everything a transport client needs to open a session.
#[derive(Clone)]
pub struct TransportSettings {
    /// WebSocket endpoint (direct or local proxy URL).
    pub service: String,
    pub domain: String,
    pub jid: String,
    pub password: String,
    pub resource: Option<String>,
    pub lang: Option<String>,
    /// SM state to attempt resumption with.
    pub sm: Option<SmState>,
    /// Whether the transport should send periodic `<r/>` keepalives.
    pub sm_keepalive: bool,
    pub sm_preferred_maximum: u32,
    pub request_ack_interval: Duration,
    pub ack_debounce: Duration,
}

impl TransportSettings {
    pub(crate) fn new(
        options: &ConnectOptions,
        service: &str,
        sm: Option<SmState>,
        config: &ConnectionConfig,
    ) -> Self {
        Self {
            service: service.to_string(),
            domain: options.domain().to_string(),
            jid: options.jid.clone(),
            password: options.password.clone(),
            resource: options.resource.clone(),
            lang: options.lang.clone(),
            sm,
            sm_keepalive: !options.disable_sm_keepalive,
            sm_preferred_maximum: config.sm_preferred_maximum_secs,
            request_ack_interval: Duration::from_millis(config.request_ack_interval_ms),
            ack_debounce: config.ack_debounce(),
        }
    }
}

impl std::fmt::Debug for TransportSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSettings")
            .field("service", &self.service)
            .field("jid", &self.jid)
            .field("resource", &self.resource)
            .field("sm", &self.sm)
            .field("sm_keepalive", &self.sm_keepalive)
            .finish_non_exhaustive()
    }
}

/// Events a transport client reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Fresh session established.
    Online,
    /// Previous SM session resumed.
    Resumed,
    /// Stream or transport error; message content drives classification.
    Error(String),
    /// The socket closed. Distinct from [`TransportEvent::Offline`].
    Disconnect { clean: bool, reason: Option<String> },
    /// Client fully stopped; cleanup only.
    Offline,
    Stanza(String),
    Nonza(String),
    SmEnabled { id: String },
    SmResumed { id: String },
    SmFailed { reason: String },
}

/// Sink handed to each transport client at creation.
///
/// Events carry the client's generation so late events from a superseded
/// client are recognised and ignored.
#[derive(Clone)]
pub struct TransportEventSender {
    generation: u64,
    tx: mpsc::UnboundedSender<Command>,
}

impl TransportEventSender {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<Command>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Report an event. Returns false once the connection core is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(Command::Transport {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// A single transport client instance. One instance per socket; a reconnect
/// always creates a new instance.
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// Open the socket and run the handshake. Completion is signalled through
    /// `Online`/`Resumed`/`Error` events; an `Err` here means the start failed.
    async fn start(&self) -> Result<(), String>;

    async fn send(&self, stanza: String) -> Result<(), String>;

    /// Graceful protocol close.
    async fn stop(&self) -> Result<(), String>;

    /// Strip listeners and hard-close the socket without waiting for a
    /// protocol close. Must not block.
    fn destroy(&self);

    fn sm_status(&self) -> SmStatus;

    /// Send `<r/>` and resolve once the matching `<a/>` arrives.
    async fn request_ack(&self) -> Result<(), String>;

    /// Send an XMPP ping IQ and resolve on its result.
    async fn ping(&self) -> Result<(), String>;

    /// Send any debounced `<a/>` immediately.
    async fn flush_ack(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Creates transport clients. Creation must not block; the handshake starts
/// with [`TransportClient::start`].
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        settings: TransportSettings,
        events: TransportEventSender,
    ) -> Arc<dyn TransportClient>;
}

/// Coalesces outgoing SM acknowledgements.
///
/// Servers often send bursts of `<r/>`; answering each with its own `<a/>`
/// floods the socket. The debouncer keeps only the latest `h` and releases it
/// once per window.
#[derive(Debug, Clone)]
pub struct AckDebouncer {
    window: Duration,
    pending: Option<u32>,
    deadline: Option<Instant>,
}

impl AckDebouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: None,
            deadline: None,
        }
    }

    /// Record an ack request for `inbound`. Returns `true` when a new window
    /// opened and the caller must arm a timer for [`AckDebouncer::deadline`].
    pub fn request(&mut self, inbound: u32, now: Instant) -> bool {
        self.pending = Some(inbound);
        if self.deadline.is_none() {
            self.deadline = Some(now + self.window);
            true
        } else {
            false
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// The `h` to send, once the window has elapsed.
    pub fn poll(&mut self, now: Instant) -> Option<u32> {
        match self.deadline {
            Some(deadline) if now >= deadline => self.flush(),
            _ => None,
        }
    }

    /// Release the pending `h` immediately (disconnect, teardown).
    pub fn flush(&mut self) -> Option<u32> {
        self.deadline = None;
        self.pending.take()
    }
}

/// Outbound stanzas not yet acknowledged by the server.
#[derive(Debug, Clone, Default)]
pub struct OutboundQueue {
    unacked: VecDeque<String>,
    acked: u32,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, stanza: String) {
        self.unacked.push_back(stanza);
    }

    pub fn len(&self) -> usize {
        self.unacked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.unacked.is_empty()
    }

    /// Server-side count of stanzas it has handled.
    pub fn acked(&self) -> u32 {
        self.acked
    }

    /// Apply `<a h=…/>`, returning the stanzas it confirms.
    ///
    /// An `h` ahead of our queue (server counted stanzas we never tracked)
    /// drains the queue and resynchronises the counter instead of failing.
    pub fn acknowledge(&mut self, h: u32) -> Vec<String> {
        let delta = h.wrapping_sub(self.acked);
        if delta == 0 {
            return Vec::new();
        }
        if delta > u32::MAX / 2 {
            debug!(h, acked = self.acked, "Ignoring stale SM acknowledgement");
            return Vec::new();
        }

        let delta = delta as usize;
        if delta > self.unacked.len() {
            warn!(
                h,
                acked = self.acked,
                queued = self.unacked.len(),
                "SM acknowledgement exceeds outbound queue, resynchronising"
            );
            self.acked = h;
            return self.unacked.drain(..).collect();
        }

        self.acked = h;
        self.unacked.drain(..delta).collect()
    }

    /// After `<resumed h=…/>`: drop what the server confirmed and return the
    /// rest for retransmission.
    pub fn resume(&mut self, h: u32) -> Vec<String> {
        self.acknowledge(h);
        self.unacked.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resumable_state_requires_id() {
        let mut status = SmStatus {
            inbound: 4,
            enabled: true,
            ..Default::default()
        };
        assert_eq!(status.resumable_state(), None);
        status.id = Some(String::new());
        assert_eq!(status.resumable_state(), None);
        status.id = Some("sm-1".into());
        assert_eq!(
            status.resumable_state(),
            Some(SmState {
                id: "sm-1".into(),
                inbound: 4
            })
        );
    }

    #[test]
    fn test_debouncer_coalesces_requests() {
        let start = Instant::now();
        let mut debouncer = AckDebouncer::new(Duration::from_millis(250));

        assert!(debouncer.request(1, start));
        assert!(!debouncer.request(2, start + Duration::from_millis(10)));
        assert!(!debouncer.request(3, start + Duration::from_millis(20)));

        assert_eq!(debouncer.poll(start + Duration::from_millis(100)), None);
        assert_eq!(debouncer.poll(start + Duration::from_millis(250)), Some(3));
        assert!(!debouncer.is_pending());
        assert_eq!(debouncer.deadline(), None);
    }

    #[test]
    fn test_debouncer_flush_releases_early() {
        let start = Instant::now();
        let mut debouncer = AckDebouncer::new(Duration::from_secs(1));
        debouncer.request(9, start);
        assert_eq!(debouncer.flush(), Some(9));
        assert_eq!(debouncer.flush(), None);
        // A new request opens a fresh window
        assert!(debouncer.request(10, start));
    }

    #[test]
    fn test_queue_acknowledges_in_order() {
        let mut queue = OutboundQueue::new();
        for i in 0..3 {
            queue.push(format!("<message id='{}'/>", i));
        }
        let acked = queue.acknowledge(2);
        assert_eq!(acked, vec!["<message id='0'/>", "<message id='1'/>"]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.acked(), 2);
        assert!(queue.acknowledge(2).is_empty());
    }

    #[test]
    fn test_queue_tolerates_ack_beyond_queue() {
        let mut queue = OutboundQueue::new();
        queue.push("<iq/>".into());
        let acked = queue.acknowledge(5);
        assert_eq!(acked, vec!["<iq/>"]);
        assert!(queue.is_empty());
        assert_eq!(queue.acked(), 5);

        // Empty queue, further ack: no panic, counter follows the server
        assert!(queue.acknowledge(7).is_empty());
        assert_eq!(queue.acked(), 7);
    }

    #[test]
    fn test_queue_ignores_stale_ack() {
        let mut queue = OutboundQueue::new();
        queue.push("a".into());
        queue.push("b".into());
        queue.acknowledge(1);
        assert!(queue.acknowledge(0).is_empty());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_queue_wraps_counter() {
        let mut queue = OutboundQueue {
            unacked: VecDeque::new(),
            acked: u32::MAX,
        };
        queue.push("x".into());
        assert_eq!(queue.acknowledge(0), vec!["x"]);
    }

    #[test]
    fn test_resume_returns_unacked_for_retransmission() {
        let mut queue = OutboundQueue::new();
        for s in ["a", "b", "c"] {
            queue.push(s.into());
        }
        assert_eq!(queue.resume(1), vec!["b", "c"]);
    }
}
