//! Forward handler for non-CONNECT requests.
//!
//! The request is re-issued to the origin named in its absolute-form target
//! (or `Host` header for origin-form targets) with hop-by-hop headers
//! removed, and the origin's status, headers and body are streamed back.
//! One exchange per client connection: both sides are told
//! `Connection: close`. Redirects are passed through, never followed.

use crate::audit::{self, ProxyMode};
use crate::body::{self, BodyFraming};
use crate::connect::{connect_upstream, unreachable_status};
use crate::error::{ProxyError, Result};
use crate::headers::HeaderFilter;
use crate::http::{self, header_bytes, Header, RequestHead, ResponseHead, MAX_HEADER_SIZE};
use crate::server::ProxyCtx;
use crate::stream::{timed, ClientStream};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;
use url::Url;

/// Scheme of a forward target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetScheme {
    Http,
    Https,
}

/// Where a forwarded request goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    pub scheme: TargetScheme,
    /// Host to connect to (IPv6 without brackets)
    pub host: String,
    pub port: u16,
    /// Value for the outbound `Host` header
    pub authority: String,
    /// Origin-form request target: path plus optional query
    pub path: String,
}

impl ForwardTarget {
    /// Work out the origin for a request head.
    pub fn from_request(head: &RequestHead) -> Result<Self> {
        if head.target.starts_with('/') {
            let host = head.header("host").ok_or_else(|| {
                ProxyError::HttpParse("origin-form request without Host header".to_string())
            })?;
            return Self::parse(&format!("http://{}{}", host, head.target));
        }
        Self::parse(&head.target)
    }

    /// Parse an absolute `http://` or `https://` URI.
    pub fn parse(raw: &str) -> Result<Self> {
        let parsed = Url::parse(raw)
            .map_err(|e| ProxyError::HttpParse(format!("invalid target URI '{}': {}", raw, e)))?;

        let scheme = match parsed.scheme() {
            "http" => TargetScheme::Http,
            "https" => TargetScheme::Https,
            other => {
                return Err(ProxyError::HttpParse(format!(
                    "unsupported URI scheme: {}",
                    other
                )))
            }
        };

        let host_str = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ProxyError::HttpParse(format!("missing host in URI: {}", raw)))?;

        let default_port = match scheme {
            TargetScheme::Http => 80,
            TargetScheme::Https => 443,
        };
        let port = parsed.port().unwrap_or(default_port);
        let authority = match parsed.port() {
            Some(p) => format!("{}:{}", host_str, p),
            None => host_str.to_string(),
        };
        let host = host_str
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        let mut path = parsed.path().to_string();
        if path.is_empty() {
            path.push('/');
        }
        if let Some(query) = parsed.query() {
            path.push('?');
            path.push_str(query);
        }

        Ok(Self {
            scheme,
            host,
            port,
            authority,
            path,
        })
    }
}

/// Forward one non-CONNECT request and stream the response back.
///
/// The request head has been read; its body, if any, is still unread in
/// `client`.
pub async fn forward<C>(head: &RequestHead, client: &mut C, ctx: &ProxyCtx<'_>) -> Result<()>
where
    C: ClientStream,
{
    let prepared = ForwardTarget::from_request(head)
        .and_then(|target| Ok((target, body::request_framing(&head.headers)?)));
    let (target, framing) = match prepared {
        Ok(prepared) => prepared,
        Err(e) => {
            http::send_error(client, 400, "Bad Request").await?;
            return Err(e);
        }
    };
    debug!("Forwarding {} {}:{}{}", head.method, target.host, target.port, target.path);

    let tcp = match connect_upstream(&target.host, target.port, ctx.connect_timeout).await {
        Ok(tcp) => tcp,
        Err(e) => return fail_unreachable(client, &target, e).await,
    };

    match target.scheme {
        TargetScheme::Http => exchange(head, &target, framing, client, tcp, ctx).await,
        TargetScheme::Https => {
            let server_name = rustls::pki_types::ServerName::try_from(target.host.clone())
                .map_err(|_| ProxyError::UpstreamUnreachable {
                    host: target.host.clone(),
                    reason: "invalid server name for TLS".to_string(),
                    timed_out: false,
                });
            let handshake = match server_name {
                Ok(name) => timed(
                    ctx.connect_timeout,
                    "TLS handshake",
                    ctx.tls_connector.connect(name, tcp),
                )
                .await
                .map_err(|e| ProxyError::UpstreamUnreachable {
                    host: target.host.clone(),
                    reason: format!("TLS handshake failed: {}", e),
                    timed_out: e.kind() == std::io::ErrorKind::TimedOut,
                }),
                Err(e) => Err(e),
            };
            match handshake {
                Ok(tls) => exchange(head, &target, framing, client, tls, ctx).await,
                Err(e) => fail_unreachable(client, &target, e).await,
            }
        }
    }
}

async fn fail_unreachable<C>(
    client: &mut C,
    target: &ForwardTarget,
    err: ProxyError,
) -> Result<()>
where
    C: ClientStream,
{
    audit::log_unreachable(ProxyMode::Forward, &target.host, target.port, &err.to_string());
    let (status, reason) = unreachable_status(&err);
    http::send_error(client, status, reason).await?;
    Err(err)
}

/// Send the request, relay its body, then relay the response.
async fn exchange<C, U>(
    head: &RequestHead,
    target: &ForwardTarget,
    framing: BodyFraming,
    client: &mut C,
    upstream: U,
    ctx: &ProxyCtx<'_>,
) -> Result<()>
where
    C: ClientStream,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let mut upstream = BufReader::new(upstream);
    let request_filter = HeaderFilter::hop_by_hop().deny("host").deny("expect");
    let response_filter = HeaderFilter::hop_by_hop();

    // The expectation is answered here rather than forwarded, so the client
    // sends its body without waiting on the origin.
    if framing != BodyFraming::Empty && expects_continue(head) {
        client.write_all(CONTINUE).await?;
        client.flush().await?;
    }

    let request = build_upstream_request(head, target, framing, &request_filter);
    let sent = async {
        upstream.write_all(&request).await?;
        body::copy_body(&mut *client, &mut upstream, framing, ctx.idle_timeout).await
    }
    .await;
    if let Err(e) = sent {
        debug!("Sending request to {} failed: {}", target.host, e);
        http::send_error(client, 502, "Bad Gateway").await?;
        return Err(e);
    }

    let read = read_final_response(&mut upstream, ctx).await.and_then(|response| {
        let framing = body::response_framing(&head.method, response.status, &response.headers)?;
        Ok((response, framing))
    });
    let (response, response_framing) = match read {
        Ok(read) => read,
        Err(e) => {
            debug!("Upstream response error from {}: {}", target.host, e);
            http::send_error(client, 502, "Bad Gateway").await?;
            return Err(e);
        }
    };

    let response_head = build_client_response(&response, response_framing, &response_filter);
    client.write_all(&response_head).await?;
    let bytes = body::copy_body(&mut upstream, client, response_framing, ctx.idle_timeout).await?;

    audit::log_forward(&head.method, &target.host, target.port, response.status, bytes);
    Ok(())
}

const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

fn expects_continue(head: &RequestHead) -> bool {
    head.header("expect")
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("100-continue"))
}

/// Read response heads, skipping interim 1xx responses (`100 Continue`).
async fn read_final_response<U>(
    upstream: &mut BufReader<U>,
    ctx: &ProxyCtx<'_>,
) -> Result<ResponseHead>
where
    U: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let response = match tokio::time::timeout(
            ctx.idle_timeout,
            http::read_response_head(upstream, MAX_HEADER_SIZE),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(ProxyError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "upstream response timed out",
                )))
            }
        };
        if (100..200).contains(&response.status) {
            debug!("Skipping interim {} response", response.status);
            continue;
        }
        return Ok(response);
    }
}

/// Serialize the outbound request head.
fn build_upstream_request(
    head: &RequestHead,
    target: &ForwardTarget,
    framing: BodyFraming,
    filter: &HeaderFilter,
) -> Vec<u8> {
    let mut request = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\n",
        head.method, target.path, target.authority
    )
    .into_bytes();
    let forwarded = filter.apply(&head.headers);
    http::push_headers(&mut request, framed_headers(&forwarded, framing));
    if framing == BodyFraming::Chunked {
        let coding = header_bytes(&head.headers, "transfer-encoding").unwrap_or(b"chunked");
        http::push_headers(&mut request, [("Transfer-Encoding", coding)]);
    }
    request.extend_from_slice(b"Connection: close\r\n\r\n");
    request
}

/// Serialize the response head sent back to the client. Reason phrase and
/// header values are copied byte for byte.
fn build_client_response(
    response: &ResponseHead,
    framing: BodyFraming,
    filter: &HeaderFilter,
) -> Vec<u8> {
    let mut head = format!("HTTP/1.1 {} ", response.status).into_bytes();
    head.extend_from_slice(&response.reason);
    head.extend_from_slice(b"\r\n");
    let forwarded = filter.apply(&response.headers);
    http::push_headers(&mut head, framed_headers(&forwarded, framing));
    if framing == BodyFraming::Chunked {
        let coding = header_bytes(&response.headers, "transfer-encoding").unwrap_or(b"chunked");
        http::push_headers(&mut head, [("Transfer-Encoding", coding)]);
    }
    head.extend_from_slice(b"Connection: close\r\n\r\n");
    head
}

/// Forwarded headers as name/value pairs. A chunked message must not also
/// carry `Content-Length`.
fn framed_headers(
    headers: &[Header],
    framing: BodyFraming,
) -> impl Iterator<Item = (&str, &[u8])> {
    headers
        .iter()
        .filter(move |(name, _)| {
            framing != BodyFraming::Chunked || !name.eq_ignore_ascii_case("content-length")
        })
        .map(|(n, v)| (n.as_str(), v.as_slice()))
}
