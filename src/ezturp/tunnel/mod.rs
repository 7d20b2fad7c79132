//! Reverse tunnel core.
//!
//! A client inside a private network dials out to a public server and keeps one internal
//! link open to it. The server multiplexes external TCP connections or UDP flows over that
//! link as sessions, and the client relays each session to the local service.

pub mod link;
pub mod protocol;
pub mod registry;
pub mod tcp;
pub mod udp;

use thiserror::Error;
use tokio::sync::watch;

use crate::ezturp::{config::Settings, net::normalize_bind_addr, tunnel::protocol::ProtocolError};

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("resolve {addr}: {source}")]
    Resolve {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("internal connection is not established")]
    NoInternalLink,
    #[error("internal connection lost: {0}")]
    LinkLost(#[source] ProtocolError),
    #[error("keep-alive failed: {0}")]
    KeepAlive(#[source] ProtocolError),
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub name: String,
    /// Where tunnel clients connect to.
    pub internal_addr: String,
    /// Where public users connect to.
    pub external_addr: String,
    pub settings: Settings,
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub name: String,
    /// The service being exposed.
    pub local_addr: String,
    /// The server's internal address.
    pub internal_addr: String,
    pub settings: Settings,
}

/// Span every event and task of one tunnel instance runs in.
pub fn instance_span(service: &'static str, name: &str) -> tracing::Span {
    tracing::info_span!("tunnel", service, name = %name)
}

/// Resolves once shutdown is signalled or the sender is gone.
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn bind_tcp(addr: &str) -> Result<tokio::net::TcpListener, TunnelError> {
    let bind_addr = normalize_bind_addr(addr);
    tokio::net::TcpListener::bind(bind_addr.as_ref())
        .await
        .map_err(|source| TunnelError::Bind {
            addr: addr.to_string(),
            source,
        })
}

async fn bind_udp(addr: &str) -> Result<tokio::net::UdpSocket, TunnelError> {
    let bind_addr = normalize_bind_addr(addr);
    tokio::net::UdpSocket::bind(bind_addr.as_ref())
        .await
        .map_err(|source| TunnelError::Bind {
            addr: addr.to_string(),
            source,
        })
}
