//! HTTP CONNECT tunnel handler.
//!
//! Handles `CONNECT host:port HTTP/1.1` requests by:
//! 1. Parsing the target authority (no port = bad target, no connect)
//! 2. Establishing a TCP connection to the upstream
//! 3. Returning `200 Connection Established`
//! 4. Relaying bytes in both directions until either side finishes
//!
//! The proxy never terminates TLS inside a tunnel; it just passes bytes
//! through. When one direction ends, both connections are shut down so the
//! other direction ends too. Half-close is not preserved.

use crate::audit::{self, ProxyMode};
use crate::error::{ProxyError, Result};
use crate::http;
use crate::server::ProxyCtx;
use crate::stream::{copy_with_activity, timed, Activity};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Upper bound on sending FIN to each side once a tunnel is over.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle of a single tunnel.
///
/// `Connecting → Established → Relaying → Closed`, or straight from
/// `Connecting` to `Closed` when the upstream cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Connecting,
    Established,
    Relaying,
    Closed,
}

impl TunnelState {
    /// Whether `next` is a legal successor of `self`.
    #[must_use]
    pub fn can_advance_to(self, next: TunnelState) -> bool {
        use TunnelState::*;
        matches!(
            (self, next),
            (Connecting, Established)
                | (Connecting, Closed)
                | (Established, Relaying)
                | (Established, Closed)
                | (Relaying, Closed)
        )
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunnelState::Connecting => "connecting",
            TunnelState::Established => "established",
            TunnelState::Relaying => "relaying",
            TunnelState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Outcome of a tunnel that reached `Established`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelReport {
    pub host: String,
    pub port: u16,
    /// Client → origin bytes
    pub bytes_up: u64,
    /// Origin → client bytes
    pub bytes_down: u64,
    pub state: TunnelState,
}

struct Tunnel {
    host: String,
    port: u16,
    state: TunnelState,
}

impl Tunnel {
    fn advance(&mut self, next: TunnelState) {
        debug_assert!(self.state.can_advance_to(next));
        debug!(
            host = %self.host,
            port = self.port,
            from = %self.state,
            to = %next,
            "tunnel state change"
        );
        self.state = next;
    }
}

/// Handle a CONNECT request whose head has already been read.
///
/// `target` is the request target (`host:port`). On a bad target or an
/// unreachable upstream the client receives an error status and no tunnel
/// is created. Relay errors after `200` are returned as
/// [`ProxyError::RelayFailure`] but never reported to the client.
pub async fn tunnel<C>(client: &mut C, target: &str, ctx: &ProxyCtx<'_>) -> Result<TunnelReport>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (host, port) = match parse_connect_target(target) {
        Ok(parsed) => parsed,
        Err(e) => {
            http::send_error(client, 400, "Bad Request").await?;
            return Err(e);
        }
    };
    debug!("CONNECT request to {}:{}", host, port);

    let mut session = Tunnel {
        host,
        port,
        state: TunnelState::Connecting,
    };

    let upstream = match connect_upstream(&session.host, port, ctx.connect_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            audit::log_unreachable(ProxyMode::Connect, &session.host, port, &e.to_string());
            session.advance(TunnelState::Closed);
            let (status, reason) = unreachable_status(&e);
            http::send_error(client, status, reason).await?;
            return Err(e);
        }
    };

    http::send_response(client, 200, "Connection Established", &[]).await?;
    session.advance(TunnelState::Established);
    audit::log_tunnel_open(&session.host, port);

    session.advance(TunnelState::Relaying);
    let (bytes_up, bytes_down, failure) = relay(client, upstream, ctx.idle_timeout).await;
    session.advance(TunnelState::Closed);
    audit::log_tunnel_closed(&session.host, port, bytes_up, bytes_down);

    if let Some(e) = failure {
        return Err(ProxyError::RelayFailure(e));
    }

    Ok(TunnelReport {
        host: session.host,
        port,
        bytes_up,
        bytes_down,
        state: session.state,
    })
}

/// Relay both directions concurrently until the first one finishes or the
/// tunnel sees no traffic either way for `idle`, then shut both connections
/// down. Returns (up, down, first error).
async fn relay<C>(
    client: &mut C,
    upstream: TcpStream,
    idle: Duration,
) -> (u64, u64, Option<io::Error>)
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut origin_read, mut origin_write) = upstream.into_split();
    let activity = Activity::new();
    let mut up = 0u64;
    let mut down = 0u64;

    let first = tokio::select! {
        r = copy_with_activity(&mut client_read, &mut origin_write, idle, &activity, &mut up) => r,
        r = copy_with_activity(&mut origin_read, &mut client_write, idle, &activity, &mut down) => r,
        () = activity.idle_for(idle) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("tunnel idle for {:?}", idle),
        )),
    };

    let _ = timed(SHUTDOWN_GRACE, "origin shutdown", origin_write.shutdown()).await;
    let _ = timed(SHUTDOWN_GRACE, "client shutdown", client_write.shutdown()).await;

    (up, down, first.err())
}

/// Parse the target host and port from a CONNECT request target.
///
/// Accepts `host:port` and `[v6addr]:port`. The port is mandatory.
pub fn parse_connect_target(target: &str) -> Result<(String, u16)> {
    let bad = |reason: &str| ProxyError::BadTarget {
        target: target.to_string(),
        reason: reason.to_string(),
    };

    let (host, port_str) = target.rsplit_once(':').ok_or_else(|| bad("missing port"))?;

    let host = if let Some(inner) = host.strip_prefix('[') {
        inner
            .strip_suffix(']')
            .ok_or_else(|| bad("unterminated IPv6 literal"))?
    } else if host.contains(':') {
        return Err(bad("IPv6 address must be bracketed"));
    } else {
        host
    };

    if host.is_empty() {
        return Err(bad("empty host"));
    }

    let port = port_str
        .parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| bad("invalid port"))?;

    Ok((host.to_string(), port))
}

/// Resolve `host` and connect to the first address that answers.
///
/// Each attempt is bounded by `connect_timeout`. No retries beyond walking
/// the resolved address list once.
pub async fn connect_upstream(
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream> {
    let unreachable = |reason: String, timed_out: bool| ProxyError::UpstreamUnreachable {
        host: host.to_string(),
        reason,
        timed_out,
    };

    let addrs: Vec<SocketAddr> = timed(
        connect_timeout,
        "DNS lookup",
        tokio::net::lookup_host((host, port)),
    )
    .await
    .map_err(|e| {
        debug!("DNS resolution failed for {}: {}", host, e);
        unreachable(e.to_string(), e.kind() == io::ErrorKind::TimedOut)
    })?
    .collect();

    let mut last_err = None;
    for addr in &addrs {
        match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => {
                debug!("Connect to {} failed: {}", addr, e);
                last_err = Some((e.to_string(), false));
            }
            Err(_) => {
                debug!("Connect to {} timed out", addr);
                last_err = Some(("connection timed out".to_string(), true));
            }
        }
    }

    let (reason, timed_out) =
        last_err.unwrap_or_else(|| ("DNS resolution returned no addresses".to_string(), false));
    Err(unreachable(reason, timed_out))
}

/// Status line for an upstream failure: 504 for timeouts, 502 otherwise.
#[must_use]
pub fn unreachable_status(err: &ProxyError) -> (u16, &'static str) {
    match err {
        ProxyError::UpstreamUnreachable {
            timed_out: true, ..
        } => (504, "Gateway Timeout"),
        _ => (502, "Bad Gateway"),
    }
}
