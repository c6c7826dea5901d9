//! Server resolution: turn the user-supplied server string into a WebSocket
//! endpoint.
//!
//! Explicit `ws://`/`wss://` URLs pass through. Everything else resolves via
//! XEP-0156 host-meta discovery against the JID domain, bounded in time, with
//! `wss://{host}/ws` as the fallback. Discovery never fails the caller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::dns::{parse_server_input, ParsedServer, XmppEndpoint};

/// Link relation for WebSocket endpoints in host-meta documents.
pub const WEBSOCKET_REL: &str = "urn:xmpp:alt-connections:websocket";

/// How the server string should be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerKind {
    /// Explicit `ws://` or `wss://` URL.
    WebSocket(String),
    /// Explicit `tls://` or `tcp://` URI, only dialable through a bridging proxy.
    Socket(XmppEndpoint),
    /// Bare domain (or empty: use the JID domain).
    Domain(String),
}

pub fn is_websocket_url(server: &str) -> bool {
    let lower = server.trim().to_ascii_lowercase();
    lower.starts_with("wss://") || lower.starts_with("ws://")
}

pub fn classify_server(server: &str) -> ServerKind {
    let trimmed = server.trim();
    if is_websocket_url(trimmed) {
        return ServerKind::WebSocket(trimmed.to_string());
    }
    if trimmed.starts_with("tls://") || trimmed.starts_with("tcp://") {
        if let ParsedServer::Direct(endpoint) = parse_server_input(trimmed) {
            return ServerKind::Socket(endpoint);
        }
    }
    ServerKind::Domain(trimmed.to_string())
}

pub fn default_websocket_url(host: &str) -> String {
    format!("wss://{}/ws", host)
}

/// Looks up the WebSocket endpoint advertised for a domain.
#[async_trait]
pub trait WebSocketDiscovery: Send + Sync {
    /// `Ok(None)` when the domain advertises no WebSocket endpoint.
    async fn discover(&self, domain: &str) -> Result<Option<String>, String>;
}

#[derive(Debug, Deserialize)]
struct HostMetaJson {
    #[serde(default)]
    links: Vec<HostMetaLink>,
}

#[derive(Debug, Deserialize)]
struct HostMetaLink {
    rel: Option<String>,
    href: Option<String>,
}

/// WebSocket URL from a `host-meta.json` document.
pub fn parse_host_meta_json(text: &str) -> Option<String> {
    let doc: HostMetaJson = serde_json::from_str(text).ok()?;
    doc.links
        .into_iter()
        .filter(|link| link.rel.as_deref() == Some(WEBSOCKET_REL))
        .filter_map(|link| link.href)
        .find(|href| is_websocket_url(href))
}

/// WebSocket URL from an XRD `host-meta` document.
pub fn parse_host_meta_xrd(text: &str) -> Option<String> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    loop {
        match reader.read_event() {
            Ok(Event::Empty(e)) | Ok(Event::Start(e)) if e.name().local_name().as_ref() == b"Link" => {
                let mut rel = None;
                let mut href = None;
                for attr in e.attributes().flatten() {
                    let value = String::from_utf8_lossy(&attr.value).into_owned();
                    match attr.key.as_ref() {
                        b"rel" => rel = Some(value),
                        b"href" => href = Some(value),
                        _ => {}
                    }
                }
                if rel.as_deref() == Some(WEBSOCKET_REL) {
                    if let Some(href) = href.filter(|h| is_websocket_url(h)) {
                        return Some(href);
                    }
                }
            }
            Ok(Event::Eof) => return None,
            Err(e) => {
                debug!(error = %e, "Malformed host-meta XRD");
                return None;
            }
            _ => {}
        }
    }
}

/// XEP-0156 discovery over HTTPS: JSON first, then XRD.
pub struct HostMetaDiscovery {
    client: reqwest::Client,
}

impl HostMetaDiscovery {
    pub fn new(timeout: Duration) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(format!("fluux-connection/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| format!("Failed to build HTTP client: {}", e))?;
        Ok(Self { client })
    }

    async fn fetch(&self, url: &str) -> Result<String, String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| format!("{}: {}", url, e))?;
        if !response.status().is_success() {
            return Err(format!("{}: HTTP {}", url, response.status().as_u16()));
        }
        response.text().await.map_err(|e| format!("{}: {}", url, e))
    }
}

#[async_trait]
impl WebSocketDiscovery for HostMetaDiscovery {
    async fn discover(&self, domain: &str) -> Result<Option<String>, String> {
        let json_url = format!("https://{}/.well-known/host-meta.json", domain);
        let json_error = match self.fetch(&json_url).await {
            Ok(text) => match parse_host_meta_json(&text) {
                Some(url) => return Ok(Some(url)),
                None => None,
            },
            Err(e) => Some(e),
        };

        let xrd_url = format!("https://{}/.well-known/host-meta", domain);
        match self.fetch(&xrd_url).await {
            Ok(text) => Ok(parse_host_meta_xrd(&text)),
            Err(e) => match json_error {
                Some(json_error) => Err(format!("{}; {}", json_error, e)),
                None => Ok(None),
            },
        }
    }
}

/// Resolves server strings to WebSocket URLs.
pub struct ServerResolver {
    discovery: Option<Arc<dyn WebSocketDiscovery>>,
    timeout: Duration,
}

impl ServerResolver {
    pub fn new(discovery: Option<Arc<dyn WebSocketDiscovery>>, timeout: Duration) -> Self {
        Self { discovery, timeout }
    }

    /// Resolve `server` (falling back to `domain` when empty or socket-style).
    pub async fn resolve_websocket_url(&self, server: &str, domain: &str, skip_discovery: bool) -> String {
        let host = match classify_server(server) {
            ServerKind::WebSocket(url) => return url,
            ServerKind::Domain(host) if !host.is_empty() => host,
            ServerKind::Domain(_) | ServerKind::Socket(_) => domain.to_string(),
        };
        let fallback = default_websocket_url(&host);

        if skip_discovery {
            debug!(url = %fallback, "Discovery skipped");
            return fallback;
        }
        let Some(discovery) = self.discovery.as_ref() else {
            return fallback;
        };

        let started = std::time::Instant::now();
        match tokio::time::timeout(self.timeout, discovery.discover(domain)).await {
            Ok(Ok(Some(url))) => {
                info!(domain, url = %url, discovery_ms = started.elapsed().as_millis() as u64, "Discovered WebSocket endpoint");
                url
            }
            Ok(Ok(None)) => {
                info!(domain, url = %fallback, "No WebSocket endpoint advertised, using default");
                fallback
            }
            Ok(Err(e)) => {
                warn!(domain, error = %e, url = %fallback, "WebSocket discovery failed, using default");
                fallback
            }
            Err(_) => {
                warn!(domain, timeout_ms = self.timeout.as_millis() as u64, url = %fallback, "WebSocket discovery timed out, using default");
                fallback
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::dns::ConnectionMode;
    use crate::connection::mock::MockDiscovery;

    #[test]
    fn test_classify_server() {
        assert_eq!(
            classify_server("wss://chat.example.com/xmpp"),
            ServerKind::WebSocket("wss://chat.example.com/xmpp".into())
        );
        assert_eq!(
            classify_server("example.com"),
            ServerKind::Domain("example.com".into())
        );
        match classify_server("tls://xmpp.example.com:5223") {
            ServerKind::Socket(endpoint) => {
                assert_eq!(endpoint.host, "xmpp.example.com");
                assert_eq!(endpoint.mode, ConnectionMode::DirectTls);
            }
            other => panic!("expected socket, got {:?}", other),
        }
        // host:port without a scheme is still treated as a domain-style input
        assert_eq!(
            classify_server("example.com:5222"),
            ServerKind::Domain("example.com:5222".into())
        );
    }

    #[test]
    fn test_parse_host_meta_json() {
        let doc = r#"{"links":[
            {"rel":"urn:xmpp:alt-connections:xbosh","href":"https://example.com/bosh"},
            {"rel":"urn:xmpp:alt-connections:websocket","href":"wss://example.com/xmpp-websocket"}
        ]}"#;
        assert_eq!(
            parse_host_meta_json(doc).as_deref(),
            Some("wss://example.com/xmpp-websocket")
        );
        assert_eq!(parse_host_meta_json(r#"{"links":[]}"#), None);
        assert_eq!(parse_host_meta_json("<html>"), None);
    }

    #[test]
    fn test_parse_host_meta_xrd() {
        let doc = r#"<?xml version='1.0' encoding='utf-8'?>
            <XRD xmlns='http://docs.oasis-open.org/ns/xri/xrd-1.0'>
              <Link rel="urn:xmpp:alt-connections:xbosh" href="https://example.com/bosh"/>
              <Link rel='urn:xmpp:alt-connections:websocket' href='wss://example.com:5443/ws'/>
            </XRD>"#;
        assert_eq!(
            parse_host_meta_xrd(doc).as_deref(),
            Some("wss://example.com:5443/ws")
        );
    }

    #[test]
    fn test_parse_host_meta_xrd_rejects_non_websocket_href() {
        let doc = r#"<XRD><Link rel="urn:xmpp:alt-connections:websocket" href="https://example.com/ws"/></XRD>"#;
        assert_eq!(parse_host_meta_xrd(doc), None);
    }

    fn resolver(discovery: MockDiscovery) -> ServerResolver {
        ServerResolver::new(Some(Arc::new(discovery)), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_websocket_url_passes_through() {
        let discovery = MockDiscovery::found("wss://other/ws");
        let calls = discovery.calls();
        let url = resolver(discovery)
            .resolve_websocket_url("ws://localhost:5280/ws", "b.com", false)
            .await;
        assert_eq!(url, "ws://localhost:5280/ws");
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_skip_discovery_synthesizes_default() {
        let r = resolver(MockDiscovery::found("wss://other/ws"));
        assert_eq!(
            r.resolve_websocket_url("chat.b.com", "b.com", true).await,
            "wss://chat.b.com/ws"
        );
        assert_eq!(r.resolve_websocket_url("", "b.com", true).await, "wss://b.com/ws");
        assert_eq!(
            r.resolve_websocket_url("tls://xmpp.b.com:5223", "b.com", true).await,
            "wss://b.com/ws"
        );
    }

    #[tokio::test]
    async fn test_discovery_result_is_used() {
        let r = resolver(MockDiscovery::found("wss://b.com:5443/xmpp"));
        assert_eq!(
            r.resolve_websocket_url("b.com", "b.com", false).await,
            "wss://b.com:5443/xmpp"
        );
    }

    #[tokio::test]
    async fn test_discovery_failure_falls_back() {
        let r = resolver(MockDiscovery::failing("connection refused"));
        assert_eq!(r.resolve_websocket_url("b.com", "b.com", false).await, "wss://b.com/ws");

        let r = resolver(MockDiscovery::empty());
        assert_eq!(r.resolve_websocket_url("b.com", "b.com", false).await, "wss://b.com/ws");

        let r = ServerResolver::new(None, Duration::from_secs(5));
        assert_eq!(r.resolve_websocket_url("b.com", "b.com", false).await, "wss://b.com/ws");
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_timeout_falls_back() {
        let r = resolver(MockDiscovery::hanging());
        assert_eq!(r.resolve_websocket_url("b.com", "b.com", false).await, "wss://b.com/ws");
    }
}
