//! Connection orchestrator.
//!
//! A [`Connection`] is a cheap handle onto a single actor task that owns the
//! state machine, the live transport client, the backoff timer and the attempt
//! timeout. Every input (API calls, transport events, timer expiry, results of
//! spawned async work) arrives as a [`Command`] on one queue, so transitions
//! and their side effects apply strictly in arrival order.
//!
//! Transport clients are tagged with a generation number. The live client
//! slot is cleared synchronously before any async cleanup, so late events from
//! a superseded client no longer match and are dropped.

pub mod dns;
pub mod machine;
pub mod persistence;
pub mod proxy;
pub mod resolve;

#[cfg(test)]
pub(crate) mod mock;

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ConnectionConfig;
use crate::error::{ConnectionError, ConnectionResult, StreamErrorKind};
use crate::status::{
    now_millis, DiagnosticCategory, DiagnosticEvent, Notification, NotificationKind,
    StatusSnapshot,
};
use crate::storage::{JoinedRoomInfo, SessionStore};
use crate::transport::{
    SmState, TransportClient, TransportEvent, TransportEventSender, TransportFactory,
    TransportSettings,
};

use machine::{
    BackoffPolicy, ConnectedState, ConnectionMachine, ConnectionState, MachineEvent,
    ReconnectingState, TerminalReason, Transition,
};
use persistence::{LoadedSession, SmPersistence};
use proxy::{ConnectionMethod, ProxyAdapter, ProxyEndpoint, ProxyManager};
use resolve::{is_websocket_url, HostMetaDiscovery, ServerResolver, WebSocketDiscovery};

/// Capacity of the diagnostics broadcast; slow subscribers lose the oldest lines.
const DIAGNOSTICS_CAPACITY: usize = 256;

/// Per-connect configuration, kept as the session credentials until manual
/// disconnect, authentication failure or resource conflict.
#[derive(Clone, Default)]
pub struct ConnectOptions {
    pub jid: String,
    pub password: String,
    /// Bare domain, `wss://` URL, or `tls://`/`tcp://` URI. Empty means the JID domain.
    pub server: String,
    pub resource: Option<String>,
    /// SM state to resume; when absent, stored state for the JID is used.
    pub sm_resume: Option<SmState>,
    pub lang: Option<String>,
    pub skip_discovery: bool,
    pub disable_sm_keepalive: bool,
}

impl ConnectOptions {
    pub fn new(jid: impl Into<String>, password: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            jid: jid.into(),
            password: password.into(),
            server: server.into(),
            ..Default::default()
        }
    }

    /// JID without its resource.
    pub fn bare_jid(&self) -> &str {
        self.jid.split('/').next().unwrap_or(&self.jid)
    }

    pub fn domain(&self) -> &str {
        let bare = self.bare_jid();
        bare.rsplit_once('@').map(|(_, domain)| domain).unwrap_or(bare)
    }
}

impl std::fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("jid", &self.jid)
            .field("server", &self.server)
            .field("resource", &self.resource)
            .field("sm_resume", &self.sm_resume)
            .field("skip_discovery", &self.skip_discovery)
            .finish_non_exhaustive()
    }
}

/// Passed to [`SessionHandler::on_connected`] and returned by `connect()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedInfo {
    pub is_resumption: bool,
    /// Rooms to rejoin; empty for resumed sessions.
    pub rejoin_rooms: Vec<JoinedRoomInfo>,
    pub connection_method: ConnectionMethod,
}

/// Coarse platform signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemState {
    Awake,
    Sleeping,
    Visible,
    Hidden,
}

/// Callbacks into the layer above (roster, presence, rooms, message store).
#[async_trait]
pub trait SessionHandler: Send + Sync {
    fn on_connected(&self, _info: &ConnectedInfo) {}

    fn on_disconnected(&self) {}

    fn on_stanza(&self, _stanza: &str) {}

    fn on_notification(&self, _notification: &Notification) {}

    /// Rooms currently joined, snapshotted for rejoin and persistence.
    fn joined_rooms(&self) -> Vec<JoinedRoomInfo> {
        Vec::new()
    }

    /// Write buffered incoming messages to durable storage.
    async fn flush_pending_messages(&self) -> Result<(), String> {
        Ok(())
    }
}

struct NoopHandler;

impl SessionHandler for NoopHandler {}

pub(crate) enum Command {
    Connect {
        options: ConnectOptions,
        reply: oneshot::Sender<ConnectionResult<ConnectedInfo>>,
    },
    Prepared {
        session: u64,
        endpoint: ProxyEndpoint,
        loaded: LoadedSession,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Verify {
        timeout: Duration,
        reply: oneshot::Sender<bool>,
    },
    VerifyFinished {
        generation: u64,
        result: Result<(), String>,
        reply: Option<oneshot::Sender<bool>>,
    },
    DeadSocket {
        reason: String,
    },
    TriggerReconnect,
    CancelReconnect,
    SystemState {
        state: SystemState,
        sleep_duration: Option<Duration>,
    },
    RetryTimerExpired {
        session: u64,
        attempt: u32,
    },
    AttemptReady {
        session: u64,
        attempt: u32,
        endpoint: ProxyEndpoint,
    },
    AttemptTimeout {
        generation: u64,
    },
    StartFailed {
        generation: u64,
        reason: String,
    },
    Transport {
        generation: u64,
        event: TransportEvent,
    },
}

#[derive(Clone)]
struct LiveClient {
    generation: u64,
    client: Arc<dyn TransportClient>,
}

struct Identity {
    jid: String,
    resource: Option<String>,
}

/// State read synchronously from the handle side.
struct Shared {
    sm: SmPersistence,
    handler: Arc<dyn SessionHandler>,
    live: Mutex<Option<LiveClient>>,
    identity: Mutex<Option<Identity>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn live(&self) -> Option<LiveClient> {
        lock(&self.live).clone()
    }

    fn live_generation(&self) -> Option<u64> {
        lock(&self.live).as_ref().map(|l| l.generation)
    }

    fn set_live(&self, live: LiveClient) {
        *lock(&self.live) = Some(live);
    }

    fn take_live(&self) -> Option<LiveClient> {
        lock(&self.live).take()
    }

    fn set_identity(&self, jid: &str, resource: Option<String>) {
        *lock(&self.identity) = Some(Identity {
            jid: jid.to_string(),
            resource,
        });
    }

    fn clear_identity(&self) {
        *lock(&self.identity) = None;
    }

    fn jid(&self) -> Option<String> {
        lock(&self.identity).as_ref().map(|i| i.jid.clone())
    }

    fn resource(&self) -> Option<String> {
        lock(&self.identity).as_ref().and_then(|i| i.resource.clone())
    }
}

/// XEP-0156 host-meta lookup, used unless the builder is given another
/// discovery. `None` only when the HTTP client cannot be built.
fn default_discovery(config: &ConnectionConfig) -> Option<Arc<dyn WebSocketDiscovery>> {
    match HostMetaDiscovery::new(config.discovery_timeout()) {
        Ok(discovery) => Some(Arc::new(discovery)),
        Err(e) => {
            warn!(error = %e, "Host-meta discovery unavailable, using default WebSocket URLs");
            None
        }
    }
}

/// Configures and spawns a [`Connection`].
pub struct ConnectionBuilder {
    factory: Arc<dyn TransportFactory>,
    config: ConnectionConfig,
    proxy: Option<Arc<dyn ProxyAdapter>>,
    store: Option<Arc<dyn SessionStore>>,
    discovery: Option<Arc<dyn WebSocketDiscovery>>,
    handler: Arc<dyn SessionHandler>,
}

impl ConnectionBuilder {
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            factory,
            config: ConnectionConfig::default(),
            proxy: None,
            store: None,
            discovery: None,
            handler: Arc::new(NoopHandler),
        }
    }

    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn proxy_adapter(mut self, adapter: Arc<dyn ProxyAdapter>) -> Self {
        self.proxy = Some(adapter);
        self
    }

    pub fn session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the default host-meta discovery.
    pub fn discovery(mut self, discovery: Arc<dyn WebSocketDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn handler(mut self, handler: Arc<dyn SessionHandler>) -> Self {
        self.handler = handler;
        self
    }

    /// Spawn the actor. Must be called inside a tokio runtime.
    pub fn build(self) -> Connection {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(StatusSnapshot::default());
        let (diagnostics, _) = broadcast::channel(DIAGNOSTICS_CAPACITY);

        let discovery = self.discovery.or_else(|| default_discovery(&self.config));
        let resolver = Arc::new(ServerResolver::new(
            discovery,
            self.config.discovery_timeout(),
        ));
        let shared = Arc::new(Shared {
            sm: SmPersistence::new(self.store, self.config.sm_state_max_age()),
            handler: self.handler,
            live: Mutex::new(None),
            identity: Mutex::new(None),
        });

        let actor = Actor {
            machine: ConnectionMachine::new(BackoffPolicy::from_config(&self.config)),
            factory: self.factory,
            proxy: Arc::new(ProxyManager::new(self.proxy, resolver)),
            shared: shared.clone(),
            tx: tx.clone(),
            status_tx,
            diagnostics: diagnostics.clone(),
            session: 0,
            next_generation: 0,
            handshake: None,
            pending_connect: None,
            retry_timer: None,
            attempt_timer: None,
            verify_aborts: VerifyAborts::default(),
            persists: Vec::new(),
            credentials: None,
            service_url: String::new(),
            connection_method: ConnectionMethod::WebSocket,
            via_proxy: false,
            rejoin_rooms: Vec::new(),
            deferred: VecDeque::new(),
            config: self.config.clone(),
        };
        tokio::spawn(actor.run(rx));

        Connection {
            tx,
            status: status_rx,
            diagnostics,
            shared,
            verify_timeout: self.config.verify_timeout(),
        }
    }
}

/// Handle onto the connection actor. Clones share the same connection.
#[derive(Clone)]
pub struct Connection {
    tx: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<StatusSnapshot>,
    diagnostics: broadcast::Sender<DiagnosticEvent>,
    shared: Arc<Shared>,
    verify_timeout: Duration,
}

impl Connection {
    pub fn builder(factory: Arc<dyn TransportFactory>) -> ConnectionBuilder {
        ConnectionBuilder::new(factory)
    }

    /// Connect and wait for the first online/resumed event or fatal error.
    pub async fn connect(&self, options: ConnectOptions) -> ConnectionResult<ConnectedInfo> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Connect { options, reply })
            .map_err(|_| ConnectionError::Stopped)?;
        rx.await.map_err(|_| ConnectionError::Stopped)?
    }

    /// Manual disconnect. The state change is immediate; the returned future
    /// completes once best-effort cleanup has finished.
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Disconnect { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Probe the live socket (SM ack request, or ping without SM). A failed
    /// probe starts dead-socket recovery.
    pub async fn verify_connection(&self, timeout: Option<Duration>) -> bool {
        if self.shared.live_generation().is_none() {
            return false;
        }
        let (reply, rx) = oneshot::channel();
        let timeout = timeout.unwrap_or(self.verify_timeout);
        if self.tx.send(Command::Verify { timeout, reply }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub fn handle_dead_socket(&self) {
        let _ = self.tx.send(Command::DeadSocket {
            reason: "Dead socket detected".to_string(),
        });
    }

    pub fn trigger_reconnect(&self) {
        let _ = self.tx.send(Command::TriggerReconnect);
    }

    pub fn cancel_reconnect(&self) {
        let _ = self.tx.send(Command::CancelReconnect);
    }

    pub fn notify_system_state(&self, state: SystemState, sleep_duration: Option<Duration>) {
        let _ = self.tx.send(Command::SystemState {
            state,
            sleep_duration,
        });
    }

    pub fn status(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn subscribe_status(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.clone()
    }

    pub fn subscribe_diagnostics(&self) -> broadcast::Receiver<DiagnosticEvent> {
        self.diagnostics.subscribe()
    }

    pub fn current_jid(&self) -> Option<String> {
        self.shared.jid()
    }

    pub async fn send(&self, stanza: String) -> ConnectionResult<()> {
        let live = self.shared.live().ok_or(ConnectionError::NotConnected)?;
        live.client
            .send(stanza)
            .await
            .map_err(ConnectionError::Transport)
    }

    /// Synchronously persist the latest SM counter. For process teardown hooks.
    pub fn persist_now(&self) {
        let Some(jid) = self.shared.jid() else {
            return;
        };
        if let Some(live) = self.shared.live() {
            let status = live.client.sm_status();
            self.shared.sm.get_state(Some(&status));
        }
        let rooms = self.shared.handler.joined_rooms();
        self.shared
            .sm
            .persist_now(&jid, self.shared.resource().as_deref(), rooms);
    }
}

/// Abort handles of in-flight verifications. Dropping a sender aborts the
/// matching verification; senders of finished ones are pruned on the next arm.
#[derive(Default)]
struct VerifyAborts(Vec<oneshot::Sender<()>>);

impl VerifyAborts {
    fn arm(&mut self) -> oneshot::Receiver<()> {
        self.0.retain(|abort| !abort.is_closed());
        let (abort, aborted) = oneshot::channel();
        self.0.push(abort);
        aborted
    }

    fn abort_all(&mut self) {
        self.0.clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.0.len()
    }
}

struct Handshake {
    generation: u64,
    resuming: bool,
}

struct Actor {
    config: ConnectionConfig,
    machine: ConnectionMachine,
    factory: Arc<dyn TransportFactory>,
    proxy: Arc<ProxyManager>,
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<Command>,
    status_tx: watch::Sender<StatusSnapshot>,
    diagnostics: broadcast::Sender<DiagnosticEvent>,
    /// Bumped by connect and disconnect; results of async work from an older
    /// session are dropped.
    session: u64,
    next_generation: u64,
    handshake: Option<Handshake>,
    pending_connect: Option<oneshot::Sender<ConnectionResult<ConnectedInfo>>>,
    retry_timer: Option<JoinHandle<()>>,
    attempt_timer: Option<JoinHandle<()>>,
    verify_aborts: VerifyAborts,
    /// In-flight SM writes; disconnect waits for them before clearing storage.
    persists: Vec<JoinHandle<()>>,
    credentials: Option<ConnectOptions>,
    service_url: String,
    connection_method: ConnectionMethod,
    via_proxy: bool,
    rejoin_rooms: Vec<JoinedRoomInfo>,
    /// Machine events raised by entry actions, sent once the current
    /// transition has been fully applied.
    deferred: VecDeque<MachineEvent>,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            self.handle(command);
            self.publish_status();
        }
        debug!("Connection actor stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Connect { options, reply } => self.connect(options, reply),
            Command::Prepared {
                session,
                endpoint,
                loaded,
            } => self.prepared(session, endpoint, loaded),
            Command::Disconnect { reply } => self.disconnect(reply),
            Command::Verify { timeout, reply } => {
                if self.machine.state().is_connected() {
                    self.start_verification(timeout, Some(reply));
                } else {
                    let _ = reply.send(false);
                }
            }
            Command::VerifyFinished {
                generation,
                result,
                reply,
            } => self.verify_finished(generation, result, reply),
            Command::DeadSocket { reason } => self.dead_socket(reason),
            Command::TriggerReconnect => {
                if self.credentials.is_some() && self.machine.state().is_reconnecting() {
                    self.send_event(MachineEvent::TriggerReconnect);
                }
            }
            Command::CancelReconnect => {
                self.send_event(MachineEvent::CancelReconnect);
            }
            Command::SystemState {
                state,
                sleep_duration,
            } => self.system_state(state, sleep_duration),
            Command::RetryTimerExpired { session, attempt } => {
                let waiting = self.machine.state()
                    == ConnectionState::Reconnecting(ReconnectingState::Waiting);
                if session == self.session
                    && waiting
                    && attempt == self.machine.context().reconnect_attempt
                {
                    self.retry_timer = None;
                    self.send_event(MachineEvent::RetryTimerExpired);
                }
            }
            Command::AttemptReady {
                session,
                attempt,
                endpoint,
            } => self.attempt_ready(session, attempt, endpoint),
            Command::AttemptTimeout { generation } => {
                if self.handshake_generation() == Some(generation) {
                    let reason = format!(
                        "Connection attempt timed out after {}s",
                        self.config.attempt_timeout().as_secs()
                    );
                    self.fail_handshake(reason);
                }
            }
            Command::StartFailed { generation, reason } => {
                if self.handshake_generation() == Some(generation) {
                    self.fail_handshake(reason);
                }
            }
            Command::Transport { generation, event } => self.transport_event(generation, event),
        }
    }

    // --- machine plumbing ---

    fn send_event(&mut self, event: MachineEvent) -> Option<Transition> {
        let first = self.step(event);
        while let Some(next) = self.deferred.pop_front() {
            self.step(next);
        }
        first
    }

    fn step(&mut self, event: MachineEvent) -> Option<Transition> {
        let name = event.name();
        match self.machine.send(event, now_millis()) {
            Some(transition) => {
                self.on_transition(&transition);
                Some(transition)
            }
            None => {
                debug!(event = name, state = %self.machine.state(), "Event ignored in current state");
                None
            }
        }
    }

    /// Entry actions, run once per entry into a state.
    fn on_transition(&mut self, t: &Transition) {
        info!(from = %t.from, to = %t.to, event = t.event, "Connection state transition");
        match t.to {
            ConnectionState::Reconnecting(ReconnectingState::Waiting) => self.enter_waiting(),
            ConnectionState::Reconnecting(ReconnectingState::Attempting) => self.enter_attempting(),
            ConnectionState::Connected(ConnectedState::Healthy) => {
                self.cancel_retry_timer();
                self.cancel_attempt_timer();
            }
            ConnectionState::Disconnected | ConnectionState::Terminal(_) => self.enter_resting(t.to),
            ConnectionState::Idle
            | ConnectionState::Connecting
            | ConnectionState::Connected(ConnectedState::Verifying) => {}
        }
        self.publish_status();
    }

    fn enter_waiting(&mut self) {
        self.destroy_live();
        self.handshake = None;
        self.cancel_attempt_timer();
        self.abort_verifications();
        self.cancel_retry_timer();

        let context = self.machine.context();
        let attempt = context.reconnect_attempt;
        let delay_ms = context.next_retry_delay_ms;
        let reason = context.last_error.clone().unwrap_or_default();
        self.diagnostic(
            DiagnosticCategory::Reconnect,
            format!(
                "Reconnect attempt {}/{} in {}ms ({})",
                attempt,
                self.machine.policy().max_attempts,
                delay_ms,
                reason
            ),
        );

        let tx = self.tx.clone();
        let session = self.session;
        self.retry_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            let _ = tx.send(Command::RetryTimerExpired { session, attempt });
        }));
    }

    fn enter_attempting(&mut self) {
        self.cancel_retry_timer();
        let Some(credentials) = self.credentials.clone() else {
            warn!("Reconnect attempt without credentials, cancelling");
            self.deferred.push_back(MachineEvent::CancelReconnect);
            return;
        };

        // Snapshot before the old client goes away. Usually it is already
        // gone and destroy_live has refreshed the cache from it.
        let live_status = self.shared.live().map(|l| l.client.sm_status());
        self.shared.sm.get_state(live_status.as_ref());
        let rooms = self.shared.handler.joined_rooms();
        if !rooms.is_empty() {
            self.rejoin_rooms = rooms;
        }
        self.destroy_live();

        let attempt = self.machine.context().reconnect_attempt;
        info!(attempt, jid = %credentials.jid, "Starting reconnect attempt");

        if !self.via_proxy {
            self.start_client(&credentials);
            return;
        }

        let proxy = self.proxy.clone();
        let tx = self.tx.clone();
        let session = self.session;
        let server = credentials.server.clone();
        let domain = credentials.domain().to_string();
        let skip_discovery = credentials.skip_discovery;
        tokio::spawn(async move {
            let endpoint = match proxy.restart_proxy(&server, &domain).await {
                Some(endpoint) => endpoint,
                None => proxy.resolve_direct(&server, &domain, skip_discovery).await,
            };
            let _ = tx.send(Command::AttemptReady {
                session,
                attempt,
                endpoint,
            });
        });
    }

    fn attempt_ready(&mut self, session: u64, attempt: u32, endpoint: ProxyEndpoint) {
        let attempting =
            self.machine.state() == ConnectionState::Reconnecting(ReconnectingState::Attempting);
        if session != self.session
            || !attempting
            || attempt != self.machine.context().reconnect_attempt
            || self.handshake.is_some()
        {
            debug!(attempt, "Dropping stale reconnect attempt");
            return;
        }
        let Some(credentials) = self.credentials.clone() else {
            self.send_event(MachineEvent::CancelReconnect);
            return;
        };
        if !endpoint.via_proxy {
            self.diagnostic(
                DiagnosticCategory::Proxy,
                "Proxy restart failed, reconnecting directly".to_string(),
            );
        }
        self.apply_endpoint(&endpoint);
        self.start_client(&credentials);
    }

    fn enter_resting(&mut self, state: ConnectionState) {
        self.cancel_retry_timer();
        self.cancel_attempt_timer();
        self.abort_verifications();
        self.handshake = None;
        self.destroy_live();

        let context = self.machine.context().clone();
        let last_error = context.last_error.clone().unwrap_or_default();
        let outcome = match state {
            ConnectionState::Terminal(TerminalReason::Conflict) => {
                self.credentials = None;
                self.shared.sm.clear_cache();
                self.notify(
                    NotificationKind::ResourceConflict,
                    "Another client connected with the same resource".to_string(),
                );
                ConnectionError::Conflict
            }
            ConnectionState::Terminal(TerminalReason::AuthError) => {
                self.credentials = None;
                self.notify(
                    NotificationKind::AuthenticationFailed,
                    format!("Authentication failed: {}", last_error),
                );
                ConnectionError::AuthenticationFailed(last_error)
            }
            ConnectionState::Terminal(TerminalReason::MaxRetries) => {
                self.notify(
                    NotificationKind::ReconnectFailed,
                    format!(
                        "Reconnection failed after {} attempts: {}",
                        context.reconnect_attempt, last_error
                    ),
                );
                ConnectionError::MaxRetries(context.reconnect_attempt)
            }
            ConnectionState::Terminal(TerminalReason::InitialFailure) => {
                ConnectionError::InitialFailure(last_error)
            }
            _ => ConnectionError::Disconnected,
        };
        if let Some(reply) = self.pending_connect.take() {
            let _ = reply.send(Err(outcome));
        }
    }

    // --- lifecycle ---

    fn connect(
        &mut self,
        options: ConnectOptions,
        reply: oneshot::Sender<ConnectionResult<ConnectedInfo>>,
    ) {
        if let Some(previous) = self.pending_connect.take() {
            let _ = previous.send(Err(ConnectionError::Superseded));
        }
        self.session += 1;
        self.destroy_live();
        self.handshake = None;
        self.cancel_retry_timer();
        self.cancel_attempt_timer();
        self.abort_verifications();
        self.rejoin_rooms.clear();

        if self.machine.state() != ConnectionState::Idle {
            self.machine.reset();
        }
        self.send_event(MachineEvent::Connect);
        info!(jid = %options.jid, server = %options.server, "Connecting");
        self.diagnostic(
            DiagnosticCategory::Connection,
            format!("Connecting as {}", options.jid),
        );

        self.shared
            .set_identity(options.bare_jid(), options.resource.clone());
        self.credentials = Some(options.clone());
        self.pending_connect = Some(reply);

        let proxy = self.proxy.clone();
        let shared = self.shared.clone();
        let tx = self.tx.clone();
        let session = self.session;
        tokio::spawn(async move {
            let domain = options.domain();
            let endpoint = if proxy.has_adapter() && !is_websocket_url(&options.server) {
                proxy
                    .ensure_proxy(&options.server, domain, options.skip_discovery)
                    .await
            } else {
                proxy
                    .resolve_direct(&options.server, domain, options.skip_discovery)
                    .await
            };
            let loaded = if options.sm_resume.is_none() {
                shared.sm.load(options.bare_jid()).await
            } else {
                LoadedSession::default()
            };
            let _ = tx.send(Command::Prepared {
                session,
                endpoint,
                loaded,
            });
        });
    }

    fn prepared(&mut self, session: u64, endpoint: ProxyEndpoint, loaded: LoadedSession) {
        if session != self.session || self.machine.state() != ConnectionState::Connecting {
            debug!(session, "Dropping stale connect preparation");
            return;
        }
        let Some(credentials) = self.credentials.as_mut() else {
            return;
        };

        if credentials.resource.is_none() {
            if let Some(resource) = loaded.resource.clone() {
                debug!(resource = %resource, "Reusing stored resource");
                credentials.resource = Some(resource);
            }
        }
        if credentials.sm_resume.is_none() {
            credentials.sm_resume = loaded.sm_state.clone();
        }
        match credentials.sm_resume.as_ref() {
            Some(sm) => self.shared.sm.update_cache(&sm.id, sm.inbound),
            None => self.shared.sm.clear_cache(),
        }
        let credentials = credentials.clone();
        self.shared
            .set_identity(credentials.bare_jid(), credentials.resource.clone());
        self.rejoin_rooms = loaded.joined_rooms;

        self.apply_endpoint(&endpoint);
        self.start_client(&credentials);
    }

    fn apply_endpoint(&mut self, endpoint: &ProxyEndpoint) {
        self.service_url = endpoint.url.clone();
        self.connection_method = endpoint.connection_method;
        self.via_proxy = endpoint.via_proxy;
        info!(url = %endpoint.url, method = endpoint.connection_method.as_str(), via_proxy = endpoint.via_proxy, "Using endpoint");
    }

    /// Create, register and start a transport client hydrated with the cached
    /// SM state. The handshake is bounded by the attempt timeout.
    fn start_client(&mut self, credentials: &ConnectOptions) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let sm = self.shared.sm.cache();
        let resuming = sm.is_some();

        let settings = TransportSettings::new(credentials, &self.service_url, sm, &self.config);
        debug!(generation, ?settings, "Creating transport client");
        let client = self
            .factory
            .create(settings, TransportEventSender::new(generation, self.tx.clone()));
        self.shared.set_live(LiveClient {
            generation,
            client: client.clone(),
        });
        self.handshake = Some(Handshake {
            generation,
            resuming,
        });

        self.cancel_attempt_timer();
        let tx = self.tx.clone();
        let timeout = self.config.attempt_timeout();
        self.attempt_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(Command::AttemptTimeout { generation });
        }));

        let tx = self.tx.clone();
        tokio::spawn(async move {
            if let Err(reason) = client.start().await {
                let _ = tx.send(Command::StartFailed { generation, reason });
            }
        });
    }

    fn disconnect(&mut self, reply: oneshot::Sender<()>) {
        let live = self.shared.take_live();
        self.session += 1;

        self.send_event(MachineEvent::Disconnect);
        let jid = self.shared.jid();
        info!(jid = ?jid, state = %self.machine.state(), "Disconnecting");

        self.credentials = None;
        self.shared.clear_identity();
        self.shared.sm.clear_cache();
        self.rejoin_rooms.clear();
        self.handshake = None;
        self.cancel_retry_timer();
        self.cancel_attempt_timer();
        self.abort_verifications();
        if let Some(pending) = self.pending_connect.take() {
            let _ = pending.send(Err(ConnectionError::Disconnected));
        }
        self.via_proxy = false;

        self.publish_status();
        self.shared.handler.on_disconnected();
        self.diagnostic(DiagnosticCategory::Connection, "Disconnected".to_string());

        let shared = self.shared.clone();
        let proxy = self.proxy.clone();
        let step = self.config.cleanup_step_timeout();
        let persists = std::mem::take(&mut self.persists);
        tokio::spawn(async move {
            for mut persist in persists {
                bounded(step, "finish pending SM write", async {
                    (&mut persist).await.map_err(|e| e.to_string())
                })
                .await;
                persist.abort();
            }
            if let Some(jid) = jid {
                bounded(step, "clear stored SM state", async {
                    shared.sm.clear(&jid).await;
                    Ok::<(), String>(())
                })
                .await;
            }
            bounded(step, "flush pending messages", shared.handler.flush_pending_messages()).await;

            if let Some(live) = live {
                bounded(step, "flush SM ack", live.client.flush_ack()).await;
                match tokio::time::timeout(step, live.client.stop()).await {
                    Ok(Ok(())) => debug!(generation = live.generation, "Transport stopped"),
                    Ok(Err(e)) => {
                        warn!(generation = live.generation, error = %e, "Transport stop failed, destroying");
                        live.client.destroy();
                    }
                    Err(_) => {
                        warn!(generation = live.generation, "Transport stop timed out, destroying");
                        live.client.destroy();
                    }
                }
            }

            bounded(step, "stop proxy", async {
                proxy.stop_proxy().await;
                Ok::<(), String>(())
            })
            .await;
            let _ = reply.send(());
        });
    }

    fn system_state(&mut self, state: SystemState, sleep_duration: Option<Duration>) {
        match state {
            SystemState::Awake => {
                let sleep_duration = sleep_duration.unwrap_or_default();
                info!(sleep_secs = sleep_duration.as_secs(), "System awake");
                let transition = self.send_event(MachineEvent::Wake { sleep_duration });
                if matches!(transition, Some(t) if t.to == ConnectionState::Connected(ConnectedState::Verifying)) {
                    self.start_verification(self.config.verify_timeout(), None);
                }
            }
            SystemState::Visible => {
                let waiting = self.machine.state()
                    == ConnectionState::Reconnecting(ReconnectingState::Waiting);
                if waiting && self.credentials.is_some() {
                    info!("Became visible while reconnecting, attempting now");
                    self.send_event(MachineEvent::TriggerReconnect);
                }
            }
            SystemState::Sleeping | SystemState::Hidden => {
                debug!(?state, "System state change");
                let live_status = self.shared.live().map(|l| l.client.sm_status());
                self.shared.sm.get_state(live_status.as_ref());
                let rooms = self.shared.handler.joined_rooms();
                self.spawn_persist(rooms);
            }
        }
    }

    // --- dead socket and verification ---

    /// No-op unless connected.
    fn dead_socket(&mut self, reason: String) {
        if !self.machine.state().is_connected() {
            debug!(state = %self.machine.state(), "Dead socket ignored");
            return;
        }
        warn!(reason = %reason, "Dead socket");
        // The waiting entry action nulls and destroys the live client
        self.send_event(MachineEvent::SocketDied { reason });
    }

    fn start_verification(&mut self, timeout: Duration, reply: Option<oneshot::Sender<bool>>) {
        let Some(live) = self.shared.live() else {
            if let Some(reply) = reply {
                let _ = reply.send(false);
            }
            return;
        };
        let abort_rx = self.verify_aborts.arm();

        let sm_enabled = live.client.sm_status().enabled;
        self.diagnostic(
            DiagnosticCategory::Verify,
            format!(
                "Verifying connection via {}",
                if sm_enabled { "SM ack request" } else { "ping" }
            ),
        );

        let tx = self.tx.clone();
        tokio::spawn(async move {
            let probe = async {
                if sm_enabled {
                    live.client.request_ack().await
                } else {
                    live.client.ping().await
                }
            };
            let result = tokio::select! {
                outcome = tokio::time::timeout(timeout, probe) => match outcome {
                    Ok(result) => result,
                    Err(_) => Err(format!("Verification timed out after {}ms", timeout.as_millis())),
                },
                _ = abort_rx => Err("Connection closed during verification".to_string()),
            };
            let _ = tx.send(Command::VerifyFinished {
                generation: live.generation,
                result,
                reply,
            });
        });
    }

    fn verify_finished(
        &mut self,
        generation: u64,
        result: Result<(), String>,
        reply: Option<oneshot::Sender<bool>>,
    ) {
        let current = self.shared.live_generation() == Some(generation);
        let alive = current && result.is_ok();
        if let Some(reply) = reply {
            let _ = reply.send(alive);
        }
        if !current {
            return;
        }
        match result {
            Ok(()) => {
                self.diagnostic(DiagnosticCategory::Verify, "Connection verified".to_string());
                self.send_event(MachineEvent::VerifySuccess);
            }
            Err(reason) => {
                self.diagnostic(
                    DiagnosticCategory::Verify,
                    format!("Verification failed: {}", reason),
                );
                if self.machine.state() == ConnectionState::Connected(ConnectedState::Verifying) {
                    self.send_event(MachineEvent::VerifyFailed { reason });
                } else {
                    self.dead_socket(reason);
                }
            }
        }
    }

    // --- transport events ---

    fn transport_event(&mut self, generation: u64, event: TransportEvent) {
        let Some(live) = self.shared.live().filter(|l| l.generation == generation) else {
            self.stale_event(generation, event);
            return;
        };

        match event {
            TransportEvent::Online => self.handshake_succeeded(&live, false),
            TransportEvent::Resumed => self.handshake_succeeded(&live, true),
            TransportEvent::Error(reason) => self.stream_error(reason),
            TransportEvent::Disconnect { clean, reason } => self.socket_closed(clean, reason),
            TransportEvent::Offline => debug!(generation, "Transport offline"),
            TransportEvent::Stanza(stanza) => self.shared.handler.on_stanza(&stanza),
            TransportEvent::Nonza(nonza) => debug!(generation, len = nonza.len(), "Nonza received"),
            TransportEvent::SmEnabled { id } => {
                let inbound = live.client.sm_status().inbound;
                self.shared.sm.update_cache(&id, inbound);
                self.diagnostic(DiagnosticCategory::Sm, format!("Stream management enabled ({})", id));
                let rooms = self.shared.handler.joined_rooms();
                self.spawn_persist(rooms);
            }
            TransportEvent::SmResumed { id } => {
                let inbound = live.client.sm_status().inbound;
                self.shared.sm.update_cache(&id, inbound);
                self.diagnostic(DiagnosticCategory::Sm, format!("Stream management resumed ({})", id));
            }
            TransportEvent::SmFailed { reason } => {
                self.shared.sm.clear_cache();
                self.diagnostic(
                    DiagnosticCategory::Sm,
                    format!("Stream management resumption failed: {}", reason),
                );
            }
        }
    }

    fn stale_event(&mut self, generation: u64, event: TransportEvent) {
        let disconnect = matches!(event, TransportEvent::Disconnect { .. });
        if disconnect
            && self.machine.state().is_connected()
            && self.shared.live_generation().is_none()
        {
            error!(generation, state = %self.machine.state(), "Connected with no live client, forcing reconnect");
            self.send_event(MachineEvent::SocketDied {
                reason: "Socket closed".to_string(),
            });
            return;
        }
        debug!(generation, current = ?self.shared.live_generation(), "Ignoring event from superseded client");
    }

    fn handshake_succeeded(&mut self, live: &LiveClient, resumed: bool) {
        if self.handshake_generation() != Some(live.generation) {
            debug!(generation = live.generation, resumed, "Online event outside a handshake");
            return;
        }
        let resuming = self.handshake.take().is_some_and(|h| h.resuming);
        self.cancel_attempt_timer();

        match live.client.sm_status().resumable_state() {
            Some(sm) => self.shared.sm.update_cache(&sm.id, sm.inbound),
            None if !resumed => self.shared.sm.clear_cache(),
            None => {}
        }
        if resuming && !resumed {
            self.diagnostic(
                DiagnosticCategory::Sm,
                "Previous session could not be resumed, started a fresh one".to_string(),
            );
        }

        self.send_event(MachineEvent::ConnectionSuccess);

        let rejoin_rooms = if resumed {
            Vec::new()
        } else {
            std::mem::take(&mut self.rejoin_rooms)
        };
        let persisted_rooms = if resumed {
            self.shared.handler.joined_rooms()
        } else {
            rejoin_rooms.clone()
        };
        self.spawn_persist(persisted_rooms);

        let info = ConnectedInfo {
            is_resumption: resumed,
            rejoin_rooms,
            connection_method: self.connection_method,
        };
        self.diagnostic(
            DiagnosticCategory::Connection,
            if resumed {
                "Session resumed".to_string()
            } else {
                "Connected".to_string()
            },
        );
        self.shared.handler.on_connected(&info);
        if let Some(reply) = self.pending_connect.take() {
            let _ = reply.send(Ok(info));
        }
    }

    fn stream_error(&mut self, reason: String) {
        let kind = StreamErrorKind::classify(&reason);
        warn!(reason = %reason, ?kind, "Stream error");
        self.diagnostic(DiagnosticCategory::Error, format!("Stream error: {}", reason));
        match kind {
            StreamErrorKind::Conflict => {
                self.send_event(MachineEvent::Conflict);
            }
            StreamErrorKind::Authentication => {
                self.send_event(MachineEvent::AuthError { reason });
            }
            StreamErrorKind::ServerShutdown | StreamErrorKind::DeadTransport => {
                // Null before the transport's own async disconnect arrives
                self.destroy_live();
                if self.handshake.is_some() {
                    self.fail_handshake(reason);
                } else {
                    self.dead_socket(reason);
                }
            }
            StreamErrorKind::Other => {
                if self.handshake.is_some() {
                    self.fail_handshake(reason);
                }
            }
        }
    }

    fn socket_closed(&mut self, clean: bool, reason: Option<String>) {
        self.abort_verifications();
        let reason = reason.unwrap_or_else(|| "Socket closed".to_string());
        info!(clean, reason = %reason, state = %self.machine.state(), "Socket closed");

        if self.handshake.is_some() {
            let reason = if self.via_proxy && !clean {
                let message = "Connection through the local proxy closed abnormally; a firewall may be blocking the XMPP port".to_string();
                self.notify(NotificationKind::FirewallSuspected, message.clone());
                message
            } else {
                format!("Connection closed during handshake: {}", reason)
            };
            self.fail_handshake(reason);
        } else {
            self.dead_socket(reason);
        }
    }

    /// The pending handshake failed: initial connect becomes terminal, a
    /// reconnect attempt goes back to waiting or gives up.
    fn fail_handshake(&mut self, reason: String) {
        self.handshake = None;
        self.cancel_attempt_timer();
        self.destroy_live();
        warn!(reason = %reason, state = %self.machine.state(), "Connection attempt failed");
        self.send_event(MachineEvent::ConnectionError { reason });
    }

    // --- helpers ---

    fn handshake_generation(&self) -> Option<u64> {
        self.handshake.as_ref().map(|h| h.generation)
    }

    /// Null the live slot, keep its latest SM counter, then hard-close it.
    fn destroy_live(&mut self) {
        if let Some(live) = self.shared.take_live() {
            self.shared.sm.get_state(Some(&live.client.sm_status()));
            debug!(generation = live.generation, "Destroying transport client");
            live.client.destroy();
        }
    }

    fn cancel_retry_timer(&mut self) {
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
    }

    fn cancel_attempt_timer(&mut self) {
        if let Some(timer) = self.attempt_timer.take() {
            timer.abort();
        }
    }

    fn abort_verifications(&mut self) {
        self.verify_aborts.abort_all();
    }

    fn spawn_persist(&mut self, rooms: Vec<JoinedRoomInfo>) {
        let Some(jid) = self.shared.jid() else {
            return;
        };
        let shared = self.shared.clone();
        let resource = self.shared.resource();
        self.persists.retain(|persist| !persist.is_finished());
        self.persists.push(tokio::spawn(async move {
            shared.sm.persist(&jid, resource.as_deref(), rooms).await;
        }));
    }

    fn publish_status(&self) {
        let snapshot = StatusSnapshot::project(&self.machine, self.retry_timer.is_some());
        self.status_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    fn diagnostic(&self, category: DiagnosticCategory, message: String) {
        info!(category = category.as_str(), "{}", message);
        let _ = self.diagnostics.send(DiagnosticEvent {
            timestamp_ms: now_millis(),
            category,
            message,
        });
    }

    fn notify(&self, kind: NotificationKind, message: String) {
        self.diagnostic(DiagnosticCategory::Error, message.clone());
        self.shared
            .handler
            .on_notification(&Notification { kind, message });
    }
}

/// Run one best-effort cleanup step with its own deadline.
async fn bounded<F>(step: Duration, what: &str, future: F)
where
    F: Future<Output = Result<(), String>>,
{
    match tokio::time::timeout(step, future).await {
        Ok(Ok(())) => debug!(step = what, "Cleanup step done"),
        Ok(Err(e)) => warn!(step = what, error = %e, "Cleanup step failed"),
        Err(_) => warn!(step = what, timeout_ms = step.as_millis() as u64, "Cleanup step timed out"),
    }
}
