//! Error types for the hopgate-proxy crate.

use thiserror::Error;

/// Errors that can occur in the forward proxy.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Proxy bind failed on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("Privilege drop failed: {0}")]
    Privilege(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Proxy authentication required")]
    AuthRequired,

    #[error("Bad CONNECT target {target}: {reason}")]
    BadTarget { target: String, reason: String },

    #[error("Upstream connection failed to {host}: {reason}")]
    UpstreamUnreachable {
        host: String,
        reason: String,
        timed_out: bool,
    },

    #[error("Tunnel relay failed: {0}")]
    RelayFailure(#[source] std::io::Error),

    #[error("Request header exceeds {limit} bytes")]
    HeaderTooLarge { limit: usize },

    #[error("HTTP parse error: {0}")]
    HttpParse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Whether the error belongs to process startup rather than to a single
    /// request. Only these terminate the process.
    #[must_use]
    pub fn is_startup_fatal(&self) -> bool {
        matches!(
            self,
            ProxyError::Bind { .. }
                | ProxyError::Tls(_)
                | ProxyError::Privilege(_)
                | ProxyError::Config(_)
        )
    }
}

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
