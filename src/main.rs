// Diagnostic probe for the connection core: shows how a JID/server pair
// resolves and what session state is stored for it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use fluux_connection::connection::dns::{parse_server_input, resolve_xmpp_server, ParsedServer};
use fluux_connection::connection::resolve::{classify_server, ServerKind, ServerResolver};
use fluux_connection::status::now_millis;
use fluux_connection::{
    ConnectOptions, ConnectionConfig, FileSessionStore, HostMetaDiscovery, SessionStore,
};

const LOG_FILE_NAME: &str = "fluux-probe.log";

struct ProbeArgs {
    jid: String,
    server: String,
    config_path: Option<PathBuf>,
    skip_discovery: bool,
    clear_session: bool,
}

fn print_usage() {
    eprintln!("fluux-probe v{}", env!("CARGO_PKG_VERSION"));
    eprintln!();
    eprintln!("Usage: fluux-probe [OPTIONS] <JID> [SERVER]");
    eprintln!();
    eprintln!("SERVER may be a domain, a wss:// URL or a tls:// / tcp:// URI.");
    eprintln!("Defaults to the JID domain.");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -v, --verbose         Log to stderr");
    eprintln!("      --verbose=debug   Log to stderr including connection internals");
    eprintln!("      --log-file=PATH   Log to PATH, rotated daily with a date suffix");
    eprintln!("                        (default: fluux-probe.log in the platform log dir)");
    eprintln!("      --config=PATH     Load connection settings from a JSON file");
    eprintln!("      --skip-discovery  Do not query host-meta, use wss://<host>/ws");
    eprintln!("      --clear-session   Delete the stored session state for the JID");
    eprintln!("  -h, --help            Show this help message");
    eprintln!();
    eprintln!("Environment variables:");
    eprintln!("  RUST_LOG              Override log filter (e.g. RUST_LOG=debug)");
}

fn default_log_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    let dir = base.join("com.processone.fluux").join("logs");

    #[cfg(target_os = "macos")]
    let dir = dirs::home_dir()
        .map(|h| h.join("Library").join("Logs").join("com.processone.fluux"))
        .unwrap_or(dir);

    dir
}

/// Directory and file name for the daily log.
fn log_location(log_file: Option<&Path>) -> (PathBuf, String) {
    let Some(path) = log_file else {
        return (default_log_dir(), LOG_FILE_NAME.to_string());
    };
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| LOG_FILE_NAME.to_string());
    (dir, name)
}

async fn probe(args: ProbeArgs) -> Result<(), String> {
    let config = match &args.config_path {
        Some(path) => ConnectionConfig::load(path)?,
        None => ConnectionConfig::default(),
    };
    let options = ConnectOptions::new(args.jid.as_str(), "", args.server.as_str());
    let domain = options.domain().to_string();
    println!("JID:    {}", options.bare_jid());
    println!("Domain: {}", domain);

    // WebSocket endpoint, the way a connect would pick it
    let kind = classify_server(&args.server);
    let discovery = HostMetaDiscovery::new(config.discovery_timeout())?;
    let resolver = ServerResolver::new(Some(Arc::new(discovery)), config.discovery_timeout());
    let url = resolver
        .resolve_websocket_url(&args.server, &domain, args.skip_discovery)
        .await;
    println!("WebSocket: {}", url);

    // Socket candidates a bridging proxy would dial
    if !matches!(kind, ServerKind::WebSocket(_)) {
        let target = if args.server.trim().is_empty() {
            domain.clone()
        } else {
            args.server.trim().to_string()
        };
        let candidates = match parse_server_input(&target) {
            ParsedServer::Direct(endpoint) => vec![endpoint],
            ParsedServer::Domain(domain) => resolve_xmpp_server(&domain).await,
        };
        println!("Socket candidates:");
        for endpoint in candidates {
            println!("  {}", endpoint.uri());
        }
    }

    let store = FileSessionStore::default();
    let jid = options.bare_jid();
    if args.clear_session {
        store.clear_session_state(jid).await?;
        println!("Stored session cleared ({})", store.path_for(jid).display());
        return Ok(());
    }

    match store.get_session_state(jid).await? {
        None => println!("Stored session: none"),
        Some(state) => {
            let age = now_millis().saturating_sub(state.timestamp);
            let resumable = state.sm_id.is_some()
                && u128::from(age) <= config.sm_state_max_age().as_millis();
            println!("Stored session ({}):", store.path_for(jid).display());
            println!("  SM id:     {}", state.sm_id.as_deref().unwrap_or("-"));
            println!(
                "  inbound:   {}",
                state.sm_inbound.map(|h| h.to_string()).unwrap_or_else(|| "-".into())
            );
            println!("  resource:  {}", state.resource.as_deref().unwrap_or("-"));
            println!("  age:       {}s", age / 1000);
            println!("  resumable: {}", resumable);
            for room in &state.joined_rooms {
                println!("  room:      {} as {}", room.jid, room.nickname);
            }
        }
    }
    Ok(())
}

fn main() {
    // Parse CLI flags early, before tracing subscriber init
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        print_usage();
        std::process::exit(0);
    }

    let verbose_level = args.iter().find_map(|arg| {
        if arg == "--verbose" || arg == "-v" {
            Some("default")
        } else {
            arg.strip_prefix("--verbose=")
        }
    });
    let log_file_path = args
        .iter()
        .find_map(|arg| arg.strip_prefix("--log-file=").map(PathBuf::from));
    let config_path = args
        .iter()
        .find_map(|arg| arg.strip_prefix("--config=").map(PathBuf::from));

    let positional: Vec<&String> = args.iter().skip(1).filter(|arg| !arg.starts_with('-')).collect();
    let Some(jid) = positional.first() else {
        print_usage();
        std::process::exit(2);
    };
    let probe_args = ProbeArgs {
        jid: jid.to_string(),
        server: positional.get(1).map(|s| s.to_string()).unwrap_or_default(),
        config_path,
        skip_discovery: args.iter().any(|arg| arg == "--skip-discovery"),
        clear_session: args.iter().any(|arg| arg == "--clear-session"),
    };

    let (log_dir, log_name) = log_location(log_file_path.as_deref());

    // File log always, stderr only when asked for
    let _guard = {
        use tracing_subscriber::prelude::*;
        use tracing_subscriber::EnvFilter;

        if let Err(e) = std::fs::create_dir_all(&log_dir) {
            eprintln!("Warning: could not create log directory '{}': {}", log_dir.display(), e);
        }

        let file_filter = if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else {
            EnvFilter::new("fluux_connection=info,fluux_probe=info,warn")
        };
        let file_appender = tracing_appender::rolling::daily(&log_dir, &log_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_filter(file_filter);

        let stderr_layer = if verbose_level.is_some() || std::env::var("RUST_LOG").is_ok() {
            let stderr_filter = if std::env::var("RUST_LOG").is_ok() {
                EnvFilter::from_default_env()
            } else if verbose_level == Some("debug") {
                EnvFilter::new("fluux_connection=debug,fluux_probe=debug,info")
            } else {
                EnvFilter::new("fluux_connection=info,fluux_probe=info,warn")
            };
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(stderr_filter),
            )
        } else {
            None
        };

        tracing_subscriber::registry()
            .with(file_layer)
            .with(stderr_layer)
            .init();
        guard
    };

    if verbose_level.is_some() {
        eprintln!("fluux-probe v{} (build {})", env!("CARGO_PKG_VERSION"), env!("GIT_HASH"));
        eprintln!("Platform: {} / {}", std::env::consts::OS, std::env::consts::ARCH);
        eprintln!("Log file: {}", log_dir.join(&log_name).display());
        eprintln!("---");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = runtime.block_on(probe(probe_args)) {
        tracing::error!(error = %e, "Probe failed");
        eprintln!("Error: {}", e);
        drop(runtime);
        drop(_guard);
        std::process::exit(1);
    }
}
