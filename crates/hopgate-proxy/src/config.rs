//! Listener configuration.
//!
//! A [`ListenerConfig`] is assembled once (by the CLI or by an embedding
//! program) and never mutated after the server is bound.

use crate::credential::CredentialSet;
use crate::error::{ProxyError, Result};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Protocol spoken on the listening socket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Scheme {
    /// Plain TCP
    #[default]
    Http,
    /// TLS-terminated
    Https,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Http => write!(f, "http"),
            Scheme::Https => write!(f, "https"),
        }
    }
}

impl FromStr for Scheme {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            other => Err(ProxyError::Config(format!(
                "Protocol must be either http or https, got '{}'",
                other
            ))),
        }
    }
}

/// Configuration for the proxy listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Bind address (port 0 = OS-assigned ephemeral port)
    pub listen_addr: SocketAddr,

    /// Plain or TLS listener
    pub scheme: Scheme,

    /// PEM certificate chain, read only when `scheme` is https
    pub cert_path: PathBuf,

    /// PEM private key, read only when `scheme` is https
    pub key_path: PathBuf,

    /// User ID to switch to after binding
    pub uid: Option<u32>,

    /// Group ID to switch to after binding
    pub gid: Option<u32>,

    /// Accepted Basic credentials. Empty = authentication disabled.
    pub credentials: CredentialSet,

    /// Timeout for upstream connects and TLS handshakes.
    pub connect_timeout: Duration,

    /// Longest a tunnel or body relay may sit without traffic.
    pub idle_timeout: Duration,

    /// Time allowed for a client to send its request head.
    pub header_timeout: Duration,

    /// Maximum concurrent connections (0 = unlimited).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            scheme: Scheme::Http,
            cert_path: PathBuf::from("server.pem"),
            key_path: PathBuf::from("server.key"),
            uid: None,
            gid: None,
            credentials: CredentialSet::empty(),
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            header_timeout: Duration::from_secs(30),
            max_connections: 0,
        }
    }
}

impl ListenerConfig {
    /// Check the configuration before binding.
    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout.is_zero()
            || self.idle_timeout.is_zero()
            || self.header_timeout.is_zero()
        {
            return Err(ProxyError::Config(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        if self.scheme == Scheme::Https
            && (self.cert_path.as_os_str().is_empty() || self.key_path.as_os_str().is_empty())
        {
            return Err(ProxyError::Config(
                "https listener needs both a certificate and a key path".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse a listen address. Accepts `host:port`, `[v6]:port` and the
/// `:port` shorthand for all IPv4 interfaces.
pub fn parse_listen_addr(raw: &str) -> Result<SocketAddr> {
    let raw = raw.trim();
    let expanded = if raw.starts_with(':') {
        format!("0.0.0.0{}", raw)
    } else {
        raw.to_string()
    };

    if let Ok(addr) = expanded.parse::<SocketAddr>() {
        return Ok(addr);
    }

    expanded
        .to_socket_addrs()
        .map_err(|e| ProxyError::Config(format!("invalid listen address '{}': {}", raw, e)))?
        .next()
        .ok_or_else(|| ProxyError::Config(format!("listen address '{}' did not resolve", raw)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ListenerConfig::default();
        assert_eq!(config.listen_addr.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.listen_addr.port(), 0);
        assert_eq!(config.scheme, Scheme::Http);
        assert!(config.credentials.is_empty());
        assert!(config.uid.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_scheme_from_str() {
        assert_eq!("http".parse::<Scheme>().unwrap(), Scheme::Http);
        assert_eq!("https".parse::<Scheme>().unwrap(), Scheme::Https);
        assert!("socks5".parse::<Scheme>().is_err());
        assert_eq!(Scheme::Https.to_string(), "https");
    }

    #[test]
    fn test_parse_listen_addr_shorthand() {
        let addr = parse_listen_addr(":8080").unwrap();
        assert_eq!(addr, "0.0.0.0:8080".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_parse_listen_addr_forms() {
        assert_eq!(parse_listen_addr("127.0.0.1:3128").unwrap().port(), 3128);
        assert!(parse_listen_addr("[::1]:8443").unwrap().is_ipv6());
        assert!(parse_listen_addr("nonsense").is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let config = ListenerConfig {
            idle_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ProxyError::Config(_))));
    }

    #[test]
    fn test_validate_https_needs_paths() {
        let config = ListenerConfig {
            scheme: Scheme::Https,
            key_path: PathBuf::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
