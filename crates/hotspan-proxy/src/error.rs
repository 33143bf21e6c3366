//! Error types for the proxy.

use std::net::SocketAddr;

use thiserror::Error;

use hotspan_core::ClientIdentity;

/// Proxy manager error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The address that was requested.
        addr: SocketAddr,
        /// The underlying bind failure.
        #[source]
        source: std::io::Error,
    },

    /// A start was requested while the proxy is serving a different address.
    #[error("proxy already running on {0}")]
    AlreadyRunning(SocketAddr),

    /// The listening socket became unusable while serving.
    #[error("listening socket failed: {0}")]
    Fatal(String),
}

/// Result type for proxy manager operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Per-session error type. Contained within the session that produced it;
/// never escalated to the lifecycle layer.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The client's request could not be parsed as an HTTP proxy request.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// The source identity is in the registry's blocked set.
    #[error("client {0} is blocked")]
    ClientBlocked(ClientIdentity),

    /// The upstream connection could not be established.
    #[error("upstream {target} unreachable: {source}")]
    UpstreamUnreachable {
        /// Host and port the session tried to reach.
        target: String,
        /// DNS failure, refusal, or timeout.
        #[source]
        source: std::io::Error,
    },

    /// I/O failure while relaying bytes.
    #[error("relay I/O error: {0}")]
    RelayIo(#[from] std::io::Error),

    /// The session was told to terminate by a proxy shutdown.
    #[error("session cancelled by proxy shutdown")]
    Cancelled,
}
