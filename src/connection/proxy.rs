//! Lifecycle wrapper around the optional local bridging proxy.
//!
//! On desktop builds a local proxy translates the client's WebSocket framing
//! into a raw TCP/TLS XMPP stream. Pure-web deployments have no proxy; every
//! operation here degrades to direct WebSocket resolution when no adapter is
//! configured, so the orchestrator never branches on proxy presence itself.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::resolve::ServerResolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMethod {
    WebSocket,
    /// Direct TLS bridged by the proxy.
    Tls,
    /// STARTTLS bridged by the proxy.
    StartTls,
}

impl ConnectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebSocket => "websocket",
            Self::Tls => "tls",
            Self::StartTls => "starttls",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyStartResult {
    /// Local `ws://127.0.0.1:PORT` URL the transport should dial.
    pub url: String,
    pub connection_method: ConnectionMethod,
    /// Low-level endpoint the proxy actually reached (`tls://host:port?domain=d`),
    /// reusable on restart without repeating discovery.
    pub resolved_endpoint: Option<String>,
}

#[async_trait]
pub trait ProxyAdapter: Send + Sync {
    async fn start_proxy(&self, target: &str) -> Result<ProxyStartResult, String>;
    async fn stop_proxy(&self) -> Result<(), String>;
}

/// Where the transport should connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub url: String,
    pub connection_method: ConnectionMethod,
    pub via_proxy: bool,
}

impl ProxyEndpoint {
    fn direct(url: String) -> Self {
        Self {
            url,
            connection_method: ConnectionMethod::WebSocket,
            via_proxy: false,
        }
    }

    fn proxied(result: &ProxyStartResult) -> Self {
        Self {
            url: result.url.clone(),
            connection_method: result.connection_method,
            via_proxy: true,
        }
    }
}

#[derive(Debug, Default)]
struct ProxyState {
    running: bool,
    target: Option<String>,
    url: Option<String>,
    connection_method: Option<ConnectionMethod>,
    resolved_endpoint: Option<String>,
}

pub struct ProxyManager {
    adapter: Option<Arc<dyn ProxyAdapter>>,
    resolver: Arc<ServerResolver>,
    state: Mutex<ProxyState>,
}

fn proxy_target<'a>(server: &'a str, domain: &'a str) -> &'a str {
    let server = server.trim();
    if server.is_empty() {
        domain
    } else {
        server
    }
}

impl ProxyManager {
    pub fn new(adapter: Option<Arc<dyn ProxyAdapter>>, resolver: Arc<ServerResolver>) -> Self {
        Self {
            adapter,
            resolver,
            state: Mutex::new(ProxyState::default()),
        }
    }

    pub fn has_adapter(&self) -> bool {
        self.adapter.is_some()
    }

    pub async fn is_active(&self) -> bool {
        self.state.lock().await.running
    }

    /// Direct WebSocket resolution, bypassing the proxy.
    pub async fn resolve_direct(&self, server: &str, domain: &str, skip_discovery: bool) -> ProxyEndpoint {
        ProxyEndpoint::direct(
            self.resolver
                .resolve_websocket_url(server, domain, skip_discovery)
                .await,
        )
    }

    /// Start the proxy for `server` unless it is already running for it.
    /// Start failures fall back to direct WebSocket resolution.
    pub async fn ensure_proxy(&self, server: &str, domain: &str, skip_discovery: bool) -> ProxyEndpoint {
        let Some(adapter) = self.adapter.as_ref() else {
            return self.resolve_direct(server, domain, skip_discovery).await;
        };
        let target = proxy_target(server, domain);

        let mut state = self.state.lock().await;
        if state.running && state.target.as_deref() == Some(target) {
            if let (Some(url), Some(method)) = (state.url.clone(), state.connection_method) {
                debug!(target, url = %url, "Reusing running proxy");
                return ProxyEndpoint {
                    url,
                    connection_method: method,
                    via_proxy: true,
                };
            }
        }
        if state.running {
            info!(previous = ?state.target, target, "Proxy target changed, stopping previous instance");
            if let Err(e) = adapter.stop_proxy().await {
                warn!(error = %e, "Failed to stop previous proxy");
            }
            *state = ProxyState::default();
        }

        match adapter.start_proxy(target).await {
            Ok(result) => {
                info!(target, url = %result.url, method = result.connection_method.as_str(), "Proxy started");
                let endpoint = ProxyEndpoint::proxied(&result);
                Self::record(&mut state, target, result);
                endpoint
            }
            Err(e) => {
                warn!(target, error = %e, "Proxy start failed, falling back to direct WebSocket");
                drop(state);
                self.resolve_direct(server, domain, skip_discovery).await
            }
        }
    }

    /// Restart for a reconnect attempt: stop the running instance, then start
    /// against the cached resolved endpoint, then against the original server
    /// (fresh discovery, for DNS changes after sleep or a network switch).
    /// `None` when no adapter is configured or both starts failed.
    pub async fn restart_proxy(&self, server: &str, domain: &str) -> Option<ProxyEndpoint> {
        let adapter = self.adapter.as_ref()?;
        let target = proxy_target(server, domain);

        let mut state = self.state.lock().await;
        if state.running {
            if let Err(e) = adapter.stop_proxy().await {
                warn!(error = %e, "Failed to stop proxy before restart");
            }
            state.running = false;
        }

        if let Some(cached) = state.resolved_endpoint.take() {
            match adapter.start_proxy(&cached).await {
                Ok(result) => {
                    info!(endpoint = %cached, url = %result.url, "Proxy restarted on cached endpoint");
                    let endpoint = ProxyEndpoint::proxied(&result);
                    let resolved = result.resolved_endpoint.clone().unwrap_or(cached);
                    Self::record(&mut state, target, result);
                    state.resolved_endpoint = Some(resolved);
                    return Some(endpoint);
                }
                Err(e) => {
                    warn!(endpoint = %cached, error = %e, "Proxy restart on cached endpoint failed, re-resolving");
                }
            }
        }

        match adapter.start_proxy(target).await {
            Ok(result) => {
                info!(target, url = %result.url, "Proxy restarted");
                let endpoint = ProxyEndpoint::proxied(&result);
                Self::record(&mut state, target, result);
                Some(endpoint)
            }
            Err(e) => {
                warn!(target, error = %e, "Proxy restart failed");
                *state = ProxyState::default();
                None
            }
        }
    }

    /// Stop the proxy and forget its cached endpoint. No-op when not running.
    pub async fn stop_proxy(&self) {
        let Some(adapter) = self.adapter.as_ref() else {
            return;
        };
        let mut state = self.state.lock().await;
        if state.running {
            match adapter.stop_proxy().await {
                Ok(()) => info!("Proxy stopped"),
                Err(e) => warn!(error = %e, "Failed to stop proxy"),
            }
        }
        *state = ProxyState::default();
    }

    fn record(state: &mut ProxyState, target: &str, result: ProxyStartResult) {
        state.running = true;
        state.target = Some(target.to_string());
        state.url = Some(result.url);
        state.connection_method = Some(result.connection_method);
        state.resolved_endpoint = result.resolved_endpoint;
    }
}
