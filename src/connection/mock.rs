//! Scripted collaborators for orchestrator tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::proxy::{ConnectionMethod, ProxyAdapter, ProxyStartResult};
use super::resolve::WebSocketDiscovery;
use super::{ConnectedInfo, SessionHandler};
use crate::status::Notification;
use crate::storage::{JoinedRoomInfo, MemorySessionStore, SessionStore, StoredSessionState};
use crate::transport::{
    SmStatus, TransportClient, TransportEvent, TransportEventSender, TransportFactory,
    TransportSettings,
};

/// What a client does when started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Behavior {
    /// Fresh session with SM enabled.
    Online,
    /// Resume the SM state it was created with.
    Resumed,
    /// Emit a stream error.
    Fail(String),
    /// Socket closes before the handshake completes.
    Close,
    /// Never answers.
    Silent,
    /// `start()` itself fails.
    StartErr(String),
}

/// How the client answers `<r/>` and pings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    Respond,
    Fail(String),
    Hang,
}

pub struct MockClient {
    settings: TransportSettings,
    events: TransportEventSender,
    behavior: Behavior,
    sm: Mutex<SmStatus>,
    probe: Mutex<Probe>,
    sent: Mutex<Vec<String>>,
    destroyed: AtomicBool,
    stopped: AtomicBool,
}

impl MockClient {
    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    pub fn emit(&self, event: TransportEvent) {
        self.events.emit(event);
    }

    pub fn close(&self) {
        self.emit(TransportEvent::Disconnect {
            clean: false,
            reason: Some("socket closed".into()),
        });
    }

    pub fn set_inbound(&self, inbound: u32) {
        self.sm.lock().unwrap().inbound = inbound;
    }

    pub fn disable_sm(&self) {
        *self.sm.lock().unwrap() = SmStatus::default();
    }

    pub fn set_probe(&self, probe: Probe) {
        *self.probe.lock().unwrap() = probe;
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn probe(&self) -> Result<(), String> {
        let probe = self.probe.lock().unwrap().clone();
        match probe {
            Probe::Respond => Ok(()),
            Probe::Fail(reason) => Err(reason),
            Probe::Hang => std::future::pending().await,
        }
    }
}

#[async_trait]
impl TransportClient for MockClient {
    async fn start(&self) -> Result<(), String> {
        match &self.behavior {
            Behavior::Online => {
                *self.sm.lock().unwrap() = SmStatus {
                    id: Some("sm-1".into()),
                    inbound: 0,
                    enabled: true,
                    max: Some(600),
                    preferred_maximum: self.settings.sm_preferred_maximum,
                    request_ack_interval_ms: 30_000,
                };
                self.emit(TransportEvent::Online);
            }
            Behavior::Resumed => {
                if let Some(sm) = &self.settings.sm {
                    let mut status = self.sm.lock().unwrap();
                    status.id = Some(sm.id.clone());
                    status.inbound = sm.inbound;
                    status.enabled = true;
                }
                self.emit(TransportEvent::Resumed);
            }
            Behavior::Fail(reason) => self.emit(TransportEvent::Error(reason.clone())),
            Behavior::Close => self.close(),
            Behavior::Silent => {}
            Behavior::StartErr(reason) => return Err(reason.clone()),
        }
        Ok(())
    }

    async fn send(&self, stanza: String) -> Result<(), String> {
        if self.is_destroyed() {
            return Err("socket not available".into());
        }
        self.sent.lock().unwrap().push(stanza);
        Ok(())
    }

    async fn stop(&self) -> Result<(), String> {
        self.stopped.store(true, Ordering::SeqCst);
        self.emit(TransportEvent::Offline);
        Ok(())
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }

    fn sm_status(&self) -> SmStatus {
        self.sm.lock().unwrap().clone()
    }

    async fn request_ack(&self) -> Result<(), String> {
        self.probe().await
    }

    async fn ping(&self) -> Result<(), String> {
        self.probe().await
    }
}

/// Hands out clients following a script; `Online` once the script runs out.
#[derive(Default)]
pub struct MockFactory {
    script: Mutex<VecDeque<Behavior>>,
    clients: Mutex<Vec<Arc<MockClient>>>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(behaviors: impl IntoIterator<Item = Behavior>) -> Self {
        Self {
            script: Mutex::new(behaviors.into_iter().collect()),
            clients: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, behavior: Behavior) {
        self.script.lock().unwrap().push_back(behavior);
    }

    pub fn created(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    pub fn client(&self, index: usize) -> Arc<MockClient> {
        self.clients.lock().unwrap()[index].clone()
    }

    pub fn last(&self) -> Arc<MockClient> {
        self.clients.lock().unwrap().last().cloned().unwrap()
    }
}

impl TransportFactory for MockFactory {
    fn create(
        &self,
        settings: TransportSettings,
        events: TransportEventSender,
    ) -> Arc<dyn TransportClient> {
        let behavior = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Behavior::Online);
        let client = Arc::new(MockClient {
            settings,
            events,
            behavior,
            sm: Mutex::new(SmStatus::default()),
            probe: Mutex::new(Probe::Respond),
            sent: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        });
        self.clients.lock().unwrap().push(client.clone());
        client
    }
}

/// Proxy that "reaches" `tls://xmpp.b.com:5223?domain=b.com`.
#[derive(Default)]
pub struct MockProxyAdapter {
    starts: Mutex<Vec<String>>,
    stops: AtomicUsize,
    failures: AtomicUsize,
}

impl MockProxyAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_starts(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn starts(&self) -> Vec<String> {
        self.starts.lock().unwrap().clone()
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProxyAdapter for MockProxyAdapter {
    async fn start_proxy(&self, target: &str) -> Result<ProxyStartResult, String> {
        self.starts.lock().unwrap().push(target.to_string());
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(format!("failed to reach {}", target));
        }
        Ok(ProxyStartResult {
            url: "ws://127.0.0.1:41234".into(),
            connection_method: ConnectionMethod::Tls,
            resolved_endpoint: Some("tls://xmpp.b.com:5223?domain=b.com".into()),
        })
    }

    async fn stop_proxy(&self) -> Result<(), String> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

enum DiscoveryResult {
    Answer(Result<Option<String>, String>),
    Hang,
}

pub struct MockDiscovery {
    result: DiscoveryResult,
    calls: Arc<AtomicUsize>,
}

impl MockDiscovery {
    fn with(result: DiscoveryResult) -> Self {
        Self {
            result,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn found(url: &str) -> Self {
        Self::with(DiscoveryResult::Answer(Ok(Some(url.to_string()))))
    }

    pub fn empty() -> Self {
        Self::with(DiscoveryResult::Answer(Ok(None)))
    }

    pub fn failing(reason: &str) -> Self {
        Self::with(DiscoveryResult::Answer(Err(reason.to_string())))
    }

    pub fn hanging() -> Self {
        Self::with(DiscoveryResult::Hang)
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl WebSocketDiscovery for MockDiscovery {
    async fn discover(&self, _domain: &str) -> Result<Option<String>, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.result {
            DiscoveryResult::Answer(result) => result.clone(),
            DiscoveryResult::Hang => std::future::pending().await,
        }
    }
}

/// Records every callback.
#[derive(Default)]
pub struct RecordingHandler {
    pub connected: Mutex<Vec<ConnectedInfo>>,
    pub disconnects: AtomicUsize,
    pub stanzas: Mutex<Vec<String>>,
    pub notifications: Mutex<Vec<Notification>>,
    pub rooms: Mutex<Vec<JoinedRoomInfo>>,
    pub flushes: AtomicUsize,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connected(&self) -> Vec<ConnectedInfo> {
        self.connected.lock().unwrap().clone()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionHandler for RecordingHandler {
    fn on_connected(&self, info: &ConnectedInfo) {
        self.connected.lock().unwrap().push(info.clone());
    }

    fn on_disconnected(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn on_stanza(&self, stanza: &str) {
        self.stanzas.lock().unwrap().push(stanza.to_string());
    }

    fn on_notification(&self, notification: &Notification) {
        self.notifications.lock().unwrap().push(notification.clone());
    }

    fn joined_rooms(&self) -> Vec<JoinedRoomInfo> {
        self.rooms.lock().unwrap().clone()
    }

    async fn flush_pending_messages(&self) -> Result<(), String> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// In-memory store whose async writes take `delay`.
pub struct SlowStore {
    inner: MemorySessionStore,
    delay: Duration,
}

impl SlowStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MemorySessionStore::new(),
            delay,
        }
    }
}

#[async_trait]
impl SessionStore for SlowStore {
    async fn get_session_state(&self, jid: &str) -> Result<Option<StoredSessionState>, String> {
        self.inner.get_session_state(jid).await
    }

    async fn set_session_state(&self, jid: &str, state: &StoredSessionState) -> Result<(), String> {
        tokio::time::sleep(self.delay).await;
        self.inner.set_session_state(jid, state).await
    }

    fn set_session_state_sync(&self, jid: &str, state: &StoredSessionState) -> Result<(), String> {
        self.inner.set_session_state_sync(jid, state)
    }

    async fn clear_session_state(&self, jid: &str) -> Result<(), String> {
        self.inner.clear_session_state(jid).await
    }
}
