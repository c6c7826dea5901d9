//! Socket-style server input parsing and SRV candidate lookup.
//!
//! `tls://host:port`, `tcp://host:port`, `host:port` and bare domains are the
//! inputs a bridging proxy can dial. Bare domains go through SRV resolution
//! (RFC 6120 §3.2), which yields every candidate in connection-attempt order.

use std::fmt;

use tracing::{info, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

const STARTTLS_PORT: u16 = 5222;
const DIRECT_TLS_PORT: u16 = 5223;

fn elapsed_ms(start: std::time::Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Plain TCP, upgraded through STARTTLS.
    Tcp,
    /// TLS from the first byte (XEP-0368).
    DirectTls,
}

impl ConnectionMode {
    fn scheme(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::DirectTls => "tls",
        }
    }

    fn default_port(self) -> u16 {
        match self {
            Self::Tcp => STARTTLS_PORT,
            Self::DirectTls => DIRECT_TLS_PORT,
        }
    }
}

/// A dialable endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmppEndpoint {
    pub host: String,
    pub port: u16,
    pub mode: ConnectionMode,
    /// XMPP domain for TLS SNI when `host` is an SRV target that differs from
    /// the domain (RFC 6120 §13.7.2).
    pub domain: Option<String>,
}

impl XmppEndpoint {
    pub fn tls_name(&self) -> &str {
        self.domain.as_deref().unwrap_or(&self.host)
    }

    /// Render back to the input form accepted by [`parse_server_input`], so
    /// a resolved endpoint can be cached and dialled again without DNS.
    pub fn uri(&self) -> String {
        match &self.domain {
            Some(domain) => format!(
                "{}://{}:{}?domain={}",
                self.mode.scheme(),
                self.host,
                self.port,
                domain
            ),
            None => format!("{}://{}:{}", self.mode.scheme(), self.host, self.port),
        }
    }
}

impl fmt::Display for XmppEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedServer {
    /// Explicit endpoint: no SRV lookup.
    Direct(XmppEndpoint),
    /// Bare domain: resolve through SRV.
    Domain(String),
}

/// Split off an optional `?domain=` query.
fn split_domain_param(input: &str) -> (&str, Option<String>) {
    match input.split_once('?') {
        Some((host_port, query)) => (
            host_port,
            query.strip_prefix("domain=").map(str::to_string),
        ),
        None => (input, None),
    }
}

/// `host:port` with a numeric port, split on the last colon.
fn split_port(host_port: &str) -> Option<(&str, u16)> {
    let (host, port) = host_port.rsplit_once(':')?;
    port.parse::<u16>().ok().map(|port| (host, port))
}

fn scheme_endpoint(rest: &str, mode: ConnectionMode) -> XmppEndpoint {
    let (host_port, domain) = split_domain_param(rest);
    let (host, port) = split_port(host_port).unwrap_or((host_port, mode.default_port()));
    XmppEndpoint {
        host: host.to_string(),
        port,
        mode,
        domain,
    }
}

/// Parse a socket-style server input.
///
/// - `tls://host[:port][?domain=d]` → direct TLS, default port 5223
/// - `tcp://host[:port][?domain=d]` → STARTTLS, default port 5222
/// - `host:port` → direct; port 5223 means direct TLS, anything else STARTTLS
/// - anything else → bare domain
pub fn parse_server_input(server: &str) -> ParsedServer {
    let trimmed = server.trim();

    if let Some(rest) = trimmed.strip_prefix("tls://") {
        return ParsedServer::Direct(scheme_endpoint(rest, ConnectionMode::DirectTls));
    }
    if let Some(rest) = trimmed.strip_prefix("tcp://") {
        return ParsedServer::Direct(scheme_endpoint(rest, ConnectionMode::Tcp));
    }
    if let Some((host, port)) = split_port(trimmed) {
        let mode = if port == DIRECT_TLS_PORT {
            ConnectionMode::DirectTls
        } else {
            ConnectionMode::Tcp
        };
        return ParsedServer::Direct(XmppEndpoint {
            host: host.to_string(),
            port,
            mode,
            domain: None,
        });
    }

    ParsedServer::Domain(trimmed.to_string())
}

/// One SRV answer, decoupled from the resolver's record type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    pub priority: u16,
    pub weight: u16,
    pub target: String,
    pub port: u16,
}

/// Order SRV answers (priority ascending, weight descending per RFC 2782)
/// into endpoints, dropping `.` targets ("service not available").
pub fn srv_endpoints(domain: &str, mut records: Vec<SrvRecord>, mode: ConnectionMode) -> Vec<XmppEndpoint> {
    records.sort_by(|a, b| a.priority.cmp(&b.priority).then(b.weight.cmp(&a.weight)));
    records
        .into_iter()
        .filter_map(|r| {
            let target = r.target.trim_end_matches('.');
            if target.is_empty() {
                info!(domain, "SRV record with '.' target, skipping");
                return None;
            }
            Some(XmppEndpoint {
                host: target.to_string(),
                port: r.port,
                mode,
                domain: Some(domain.to_string()),
            })
        })
        .collect()
}

async fn lookup_srv(resolver: &TokioAsyncResolver, domain: &str, service: &str) -> Vec<SrvRecord> {
    let name = format!("{}._tcp.{}", service, domain);
    let started = std::time::Instant::now();
    match resolver.srv_lookup(name.as_str()).await {
        Ok(lookup) => {
            let records: Vec<SrvRecord> = lookup
                .iter()
                .map(|r| SrvRecord {
                    priority: r.priority(),
                    weight: r.weight(),
                    target: r.target().to_string(),
                    port: r.port(),
                })
                .collect();
            info!(domain, srv = %name, count = records.len(), lookup_ms = elapsed_ms(started), "SRV lookup");
            records
        }
        Err(e) => {
            info!(domain, srv = %name, lookup_ms = elapsed_ms(started), error = %e, "SRV lookup failed");
            Vec::new()
        }
    }
}

/// Resolve every candidate endpoint for `domain`:
/// `_xmpps-client` records first, then `_xmpp-client`, then `domain:5222`
/// only when no SRV record exists at all.
pub async fn resolve_xmpp_server(domain: &str) -> Vec<XmppEndpoint> {
    let started = std::time::Instant::now();
    let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "Failed to load system DNS config, using default resolver");
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        }
    };

    let direct_tls = lookup_srv(&resolver, domain, "_xmpps-client").await;
    let starttls = lookup_srv(&resolver, domain, "_xmpp-client").await;

    let mut endpoints = srv_endpoints(domain, direct_tls, ConnectionMode::DirectTls);
    endpoints.extend(srv_endpoints(domain, starttls, ConnectionMode::Tcp));

    if endpoints.is_empty() {
        warn!(
            domain,
            resolve_ms = elapsed_ms(started),
            "No SRV records found, falling back to {}:{}",
            domain,
            STARTTLS_PORT
        );
        endpoints.push(XmppEndpoint {
            host: domain.to_string(),
            port: STARTTLS_PORT,
            mode: ConnectionMode::Tcp,
            domain: None,
        });
    } else {
        info!(domain, total = endpoints.len(), resolve_ms = elapsed_ms(started), "SRV resolution complete");
    }
    endpoints
}
