//! Connection core for the Fluux XMPP client.
//!
//! Owns everything between "the user pressed connect" and "stanzas flow":
//! server resolution, the optional local bridging proxy, XEP-0198 stream
//! management persistence and resumption, dead-socket detection, backoff
//! reconnection and the explicit state machine that drives it all. The socket
//! and XMPP framing live behind [`transport::TransportClient`].

pub mod config;
pub mod connection;
pub mod error;
pub mod status;
pub mod storage;
pub mod transport;

pub use config::ConnectionConfig;
pub use connection::machine::{ConnectedState, ConnectionState, ReconnectingState, TerminalReason};
pub use connection::proxy::{ConnectionMethod, ProxyAdapter, ProxyStartResult};
pub use connection::resolve::{HostMetaDiscovery, WebSocketDiscovery};
pub use connection::{
    ConnectOptions, ConnectedInfo, Connection, ConnectionBuilder, SessionHandler, SystemState,
};
pub use error::{ConnectionError, ConnectionResult};
pub use status::{
    ConnectionStatus, DiagnosticCategory, DiagnosticEvent, Notification, NotificationKind,
    StatusSnapshot,
};
pub use storage::{
    FileSessionStore, JoinedRoomInfo, MemorySessionStore, SessionStore, StoredSessionState,
};
pub use transport::{
    SmState, SmStatus, TransportClient, TransportEvent, TransportEventSender, TransportFactory,
    TransportSettings,
};
