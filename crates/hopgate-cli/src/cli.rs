//! CLI argument definitions for hopgate
//!
//! Uses clap for argument parsing and turns the flags into a
//! [`ListenerConfig`] for the proxy engine.

use clap::{Parser, ValueEnum};
use hopgate_proxy::config::parse_listen_addr;
use hopgate_proxy::{CredentialSet, ListenerConfig, Result, Scheme};
use std::path::PathBuf;
use std::time::Duration;

/// hopgate - forward HTTP/HTTPS proxy
///
/// Serves CONNECT tunnels and plain HTTP forwarding on a single plain or
/// TLS listener, with optional Basic authentication.
#[derive(Parser, Debug)]
#[command(name = "hopgate")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "EXAMPLES:
    # Open proxy on the default port
    hopgate

    # Require credentials
    hopgate --users 'alice:secret;bob:hunter2'

    # TLS listener on 443, then drop to nobody
    sudo hopgate --listen :443 --proto https --pem server.pem --key server.key --uid 65534 --gid 65534
")]
pub struct Cli {
    /// Listen address, `host:port` or `:port`
    #[arg(long, default_value = ":8080", value_name = "ADDR")]
    pub listen: String,

    /// Listener protocol
    #[arg(long, value_enum, default_value_t = Proto::Http)]
    pub proto: Proto,

    /// PEM certificate chain (https only)
    #[arg(long, default_value = "server.pem", value_name = "FILE")]
    pub pem: PathBuf,

    /// PEM private key (https only)
    #[arg(long, default_value = "server.key", value_name = "FILE")]
    pub key: PathBuf,

    /// Accepted credentials as `user:password;user:password`.
    /// Empty disables authentication.
    #[arg(long, default_value = "", value_name = "LIST")]
    pub users: String,

    /// Switch to this user ID after binding
    #[arg(long)]
    pub uid: Option<u32>,

    /// Switch to this group ID after binding
    #[arg(long)]
    pub gid: Option<u32>,

    /// Upstream connect timeout in seconds
    #[arg(long, default_value_t = 30, value_name = "SECS")]
    pub connect_timeout: u64,

    /// Idle timeout for tunnels and body relays in seconds
    #[arg(long, default_value_t = 300, value_name = "SECS")]
    pub idle_timeout: u64,

    /// Maximum concurrent connections (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    pub max_connections: usize,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Proto {
    /// Plain TCP listener
    Http,
    /// TLS-terminated listener
    Https,
}

impl From<Proto> for Scheme {
    fn from(proto: Proto) -> Self {
        match proto {
            Proto::Http => Scheme::Http,
            Proto::Https => Scheme::Https,
        }
    }
}

impl Cli {
    /// Default log filter when `RUST_LOG` is unset.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }

    /// Assemble the listener configuration.
    pub fn listener_config(&self) -> Result<ListenerConfig> {
        Ok(ListenerConfig {
            listen_addr: parse_listen_addr(&self.listen)?,
            scheme: self.proto.into(),
            cert_path: self.pem.clone(),
            key_path: self.key.clone(),
            uid: self.uid,
            gid: self.gid,
            credentials: CredentialSet::load(&self.users),
            connect_timeout: Duration::from_secs(self.connect_timeout),
            idle_timeout: Duration::from_secs(self.idle_timeout),
            max_connections: self.max_connections,
            ..Default::default()
        })
    }
}
