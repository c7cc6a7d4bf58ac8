//! Audit logging for proxy requests.
//!
//! Logs proxy decisions with structured fields via `tracing`.
//! Credentials and bodies are never included.

use tracing::info;

/// Proxy mode for audit logging.
#[derive(Debug, Clone, Copy)]
pub enum ProxyMode {
    /// CONNECT tunnel
    Connect,
    /// Plain HTTP forwarding
    Forward,
}

impl std::fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyMode::Connect => write!(f, "connect"),
            ProxyMode::Forward => write!(f, "forward"),
        }
    }
}

/// Log a request that failed the authentication gate.
pub fn log_auth_denied(method: &str, target: &str) {
    info!(
        target: "hopgate_proxy::audit",
        method = method,
        request_target = target,
        decision = "deny",
        reason = "authentication required",
        "proxy request denied"
    );
}

/// Log a request that could not reach its upstream.
pub fn log_unreachable(mode: ProxyMode, host: &str, port: u16, reason: &str) {
    info!(
        target: "hopgate_proxy::audit",
        mode = %mode,
        host = host,
        port = port,
        decision = "fail",
        reason = reason,
        "upstream unreachable"
    );
}

/// Log an established tunnel.
pub fn log_tunnel_open(host: &str, port: u16) {
    info!(
        target: "hopgate_proxy::audit",
        mode = %ProxyMode::Connect,
        host = host,
        port = port,
        decision = "allow",
        "tunnel established"
    );
}

/// Log a closed tunnel with its byte counts.
pub fn log_tunnel_closed(host: &str, port: u16, bytes_up: u64, bytes_down: u64) {
    info!(
        target: "hopgate_proxy::audit",
        mode = %ProxyMode::Connect,
        host = host,
        port = port,
        bytes_up = bytes_up,
        bytes_down = bytes_down,
        "tunnel closed"
    );
}

/// Log a forwarded exchange.
pub fn log_forward(method: &str, host: &str, port: u16, status: u16, bytes: u64) {
    info!(
        target: "hopgate_proxy::audit",
        mode = %ProxyMode::Forward,
        method = method,
        host = host,
        port = port,
        status = status,
        bytes = bytes,
        "forward response"
    );
}
