//! Minimal HTTP/1.1 message-head handling.
//!
//! The proxy only ever needs the request line, status line and header
//! block; bodies are streamed separately (see [`crate::body`]). Heads are
//! read line by line through the caller's buffered reader so that any bytes
//! read ahead stay in the buffer for the body or tunnel that follows.
//!
//! Header values and reason phrases are kept as raw bytes: obs-text such as
//! a Latin-1 filename must reach the other side unchanged. Only the request
//! line and header names have to be ASCII.

use crate::error::{ProxyError, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum total size of a message head (64 KiB). Prevents OOM from
/// peers sending unbounded header data.
pub const MAX_HEADER_SIZE: usize = 64 * 1024;

/// A header field: name plus raw value bytes.
pub type Header = (String, Vec<u8>);

/// A parsed request line plus headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<Header>,
}

impl RequestHead {
    /// First value of a header, by case-insensitive name, if it is UTF-8.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    #[must_use]
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    fn from_lines(lines: &[Vec<u8>]) -> Result<Self> {
        let (first, rest) = lines
            .split_first()
            .ok_or_else(|| ProxyError::HttpParse("empty request head".to_string()))?;
        let first = std::str::from_utf8(first)
            .map_err(|_| ProxyError::HttpParse("request line is not valid UTF-8".to_string()))?;
        let (method, target, version) = parse_request_line(first)?;
        Ok(Self {
            method,
            target,
            version,
            headers: parse_header_lines(rest)?,
        })
    }
}

/// A parsed status line plus headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub version: String,
    pub status: u16,
    pub reason: Vec<u8>,
    pub headers: Vec<Header>,
}

impl ResponseHead {
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    fn from_lines(lines: &[Vec<u8>]) -> Result<Self> {
        let (first, rest) = lines
            .split_first()
            .ok_or_else(|| ProxyError::HttpParse("empty response head".to_string()))?;
        let (version, status, reason) = parse_status_line(first)?;
        Ok(Self {
            version,
            status,
            reason,
            headers: parse_header_lines(rest)?,
        })
    }
}

/// Read a request head. Returns `Ok(None)` if the peer closed the
/// connection before sending anything.
pub async fn read_request_head<R>(reader: &mut R, limit: usize) -> Result<Option<RequestHead>>
where
    R: AsyncBufRead + Unpin,
{
    match read_head_lines(reader, limit).await? {
        Some(lines) => RequestHead::from_lines(&lines).map(Some),
        None => Ok(None),
    }
}

/// Read a response head. A peer that closes before sending a status line
/// is an error here: the proxy has already sent it a request.
pub async fn read_response_head<R>(reader: &mut R, limit: usize) -> Result<ResponseHead>
where
    R: AsyncBufRead + Unpin,
{
    let lines = read_head_lines(reader, limit)
        .await?
        .ok_or_else(|| ProxyError::HttpParse("upstream closed before responding".to_string()))?;
    ResponseHead::from_lines(&lines)
}

/// Read LF-terminated lines up to the blank line ending the head.
///
/// Leading blank lines are skipped. `limit` bounds the total bytes read,
/// blank lines included.
async fn read_head_lines<R>(reader: &mut R, limit: usize) -> Result<Option<Vec<Vec<u8>>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = Vec::new();
    let mut consumed = 0usize;

    loop {
        let mut line = Vec::new();
        let budget = limit.saturating_sub(consumed).saturating_add(1) as u64;
        let n = (&mut *reader)
            .take(budget)
            .read_until(b'\n', &mut line)
            .await?;

        if n == 0 {
            if consumed == 0 {
                return Ok(None);
            }
            return Err(ProxyError::HttpParse(
                "connection closed inside message head".to_string(),
            ));
        }

        consumed += n;
        if consumed > limit {
            return Err(ProxyError::HeaderTooLarge { limit });
        }

        while matches!(line.last(), Some(b'\r' | b'\n')) {
            line.pop();
        }
        if line.is_empty() {
            if lines.is_empty() {
                continue;
            }
            return Ok(Some(lines));
        }
        lines.push(line);
    }
}

/// Parse an HTTP request line into (method, target, version).
fn parse_request_line(line: &str) -> Result<(String, String, String)> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    match parts.as_slice() {
        [method, target, version] if version.starts_with("HTTP/1.") => Ok((
            (*method).to_string(),
            (*target).to_string(),
            (*version).to_string(),
        )),
        _ => Err(ProxyError::HttpParse(format!(
            "malformed request line: {}",
            line
        ))),
    }
}

/// Parse a status line: "HTTP/1.1 404 Not Found". The reason may be empty
/// and is kept as raw bytes.
fn parse_status_line(line: &[u8]) -> Result<(String, u16, Vec<u8>)> {
    let malformed =
        || ProxyError::HttpParse(format!("malformed status line: {}", String::from_utf8_lossy(line)));

    let mut parts = line.splitn(3, |b| *b == b' ');
    let version = parts.next().unwrap_or_default();
    let code = parts.next().unwrap_or_default();
    let reason = trim_ows(parts.next().unwrap_or_default());

    if !version.starts_with(b"HTTP/1.") || code.len() != 3 {
        return Err(malformed());
    }
    let status = std::str::from_utf8(code)
        .ok()
        .and_then(|c| c.parse::<u16>().ok())
        .ok_or_else(malformed)?;

    Ok((
        String::from_utf8_lossy(version).into_owned(),
        status,
        reason.to_vec(),
    ))
}

fn parse_header_lines(lines: &[Vec<u8>]) -> Result<Vec<Header>> {
    let mut headers = Vec::with_capacity(lines.len());
    for line in lines {
        if line.starts_with(b" ") || line.starts_with(b"\t") {
            return Err(ProxyError::HttpParse(
                "obsolete header line folding".to_string(),
            ));
        }
        let colon = line.iter().position(|b| *b == b':').ok_or_else(|| {
            ProxyError::HttpParse(format!("malformed header: {}", String::from_utf8_lossy(line)))
        })?;
        let (name, value) = (&line[..colon], &line[colon + 1..]);
        if name.is_empty() || !name.iter().all(|b| b.is_ascii_graphic()) {
            return Err(ProxyError::HttpParse(format!(
                "invalid header name: {:?}",
                String::from_utf8_lossy(name)
            )));
        }
        // All-graphic ASCII, so this cannot fail.
        let name = String::from_utf8_lossy(name).into_owned();
        headers.push((name, trim_ows(value).to_vec()));
    }
    Ok(headers)
}

/// Strip optional whitespace (SP / HTAB) from both ends.
fn trim_ows(mut bytes: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = bytes {
        bytes = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = bytes {
        bytes = rest;
    }
    bytes
}

/// Raw bytes of the first `name` (case-insensitive) in a header list.
#[must_use]
pub fn header_bytes<'a>(headers: &'a [Header], name: &str) -> Option<&'a [u8]> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_slice())
}

/// First value of `name` (case-insensitive), when it is valid UTF-8.
#[must_use]
pub fn header_value<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    header_bytes(headers, name).and_then(|v| std::str::from_utf8(v).ok())
}

/// Append `Name: value\r\n` lines to an outgoing head.
pub fn push_headers<I, N, V>(buf: &mut Vec<u8>, headers: I)
where
    I: IntoIterator<Item = (N, V)>,
    N: AsRef<[u8]>,
    V: AsRef<[u8]>,
{
    for (name, value) in headers {
        buf.extend_from_slice(name.as_ref());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_ref());
        buf.extend_from_slice(b"\r\n");
    }
}

/// Write a bodiless response and flush.
pub async fn send_response<W>(
    stream: &mut W,
    status: u16,
    reason: &str,
    headers: &[(&str, &str)],
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut response = format!("HTTP/1.1 {} {}\r\n", status, reason).into_bytes();
    push_headers(&mut response, headers.iter().copied());
    response.extend_from_slice(b"\r\n");
    stream.write_all(&response).await?;
    stream.flush().await?;
    Ok(())
}

/// Write an error response with an empty body. The connection is closed
/// after every error, so the response says so.
pub async fn send_error<W>(stream: &mut W, status: u16, reason: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    send_response(
        stream,
        status,
        reason,
        &[("Content-Length", "0"), ("Connection", "close")],
    )
    .await
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    async fn request(raw: &str) -> Result<Option<RequestHead>> {
        let mut reader = BufReader::new(raw.as_bytes());
        read_request_head(&mut reader, MAX_HEADER_SIZE).await
    }

    #[tokio::test]
    async fn test_read_connect_head() {
        let head = request("CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert!(head.is_connect());
        assert_eq!(head.target, "example.com:443");
        assert_eq!(head.version, "HTTP/1.1");
        assert_eq!(head.header("host"), Some("example.com:443"));
    }

    #[tokio::test]
    async fn test_read_head_keeps_body_buffered() {
        let raw = "POST http://a/ HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let mut reader = BufReader::new(raw.as_bytes());
        let head = read_request_head(&mut reader, MAX_HEADER_SIZE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(head.header("Content-Length"), Some("5"));

        let mut body = String::new();
        reader.read_to_string(&mut body).await.unwrap();
        assert_eq!(body, "hello");
    }

    #[tokio::test]
    async fn test_read_head_skips_leading_blank_lines() {
        let head = request("\r\nGET / HTTP/1.1\r\nHost: a\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(head.method, "GET");
    }

    #[tokio::test]
    async fn test_read_head_eof_before_anything() {
        assert!(request("").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_head_truncated() {
        let err = request("GET / HTTP/1.1\r\nHost: a\r\n").await.unwrap_err();
        assert!(matches!(err, ProxyError::HttpParse(_)));
    }

    #[tokio::test]
    async fn test_read_head_too_large() {
        let raw = format!("GET / HTTP/1.1\r\nX-Big: {}\r\n\r\n", "a".repeat(200));
        let mut reader = BufReader::new(raw.as_bytes());
        let err = read_request_head(&mut reader, 64).await.unwrap_err();
        assert!(matches!(err, ProxyError::HeaderTooLarge { limit: 64 }));
    }

    #[tokio::test]
    async fn test_read_head_rejects_malformed_header() {
        let err = request("GET / HTTP/1.1\r\nno colon here\r\n\r\n")
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::HttpParse(_)));
    }

    #[tokio::test]
    async fn test_read_response_head() {
        let raw = "HTTP/1.1 404 Not Found\r\nContent-Length: 3\r\n\r\nnop";
        let mut reader = BufReader::new(raw.as_bytes());
        let head = read_response_head(&mut reader, MAX_HEADER_SIZE)
            .await
            .unwrap();
        assert_eq!(head.status, 404);
        assert_eq!(head.reason, b"Not Found");
        assert_eq!(head.header("content-length"), Some("3"));
    }

    #[test]
    fn test_parse_request_line_malformed() {
        assert!(parse_request_line("GET /").is_err());
        assert!(parse_request_line("").is_err());
        assert!(parse_request_line("GET / SPDY/3").is_err());
    }

    #[test]
    fn test_parse_status_line_without_reason() {
        let (_, status, reason) = parse_status_line(b"HTTP/1.1 204").unwrap();
        assert_eq!(status, 204);
        assert!(reason.is_empty());
    }

    #[test]
    fn test_parse_status_line_garbage() {
        assert!(parse_status_line(b"SSH-2.0-OpenSSH").is_err());
        assert!(parse_status_line(b"HTTP/1.1 2000 Huh").is_err());
        assert!(parse_status_line(b"HTTP/1.1 2x0 Huh").is_err());
    }

    #[tokio::test]
    async fn test_read_response_head_keeps_obs_text() {
        let raw: &[u8] =
            b"HTTP/1.1 200 Tr\xe8s bien\r\nContent-Disposition: attachment; filename=\"caf\xe9.txt\"\r\n\r\n";
        let mut reader = BufReader::new(raw);
        let head = read_response_head(&mut reader, MAX_HEADER_SIZE)
            .await
            .unwrap();
        assert_eq!(head.reason, b"Tr\xe8s bien");
        assert_eq!(
            header_bytes(&head.headers, "content-disposition").unwrap(),
            b"attachment; filename=\"caf\xe9.txt\""
        );
        // Not UTF-8, so there is no string view of it.
        assert_eq!(head.header("content-disposition"), None);
    }

    #[tokio::test]
    async fn test_read_request_head_keeps_obs_text_value() {
        let raw: &[u8] = b"GET http://a/ HTTP/1.1\r\nX-Name: Jos\xe9\r\n\r\n";
        let mut reader = BufReader::new(raw);
        let head = read_request_head(&mut reader, MAX_HEADER_SIZE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(head.headers, vec![("X-Name".to_string(), b"Jos\xe9".to_vec())]);
    }

    #[tokio::test]
    async fn test_request_line_must_be_utf8() {
        let raw: &[u8] = b"GET /caf\xe9 HTTP/1.1\r\n\r\n";
        let mut reader = BufReader::new(raw);
        let err = read_request_head(&mut reader, MAX_HEADER_SIZE)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::HttpParse(_)));
    }

    #[test]
    fn test_trim_ows() {
        assert_eq!(trim_ows(b" \t value \t"), b"value");
        assert_eq!(trim_ows(b"   "), b"");
    }

    #[tokio::test]
    async fn test_send_error_format() {
        let mut out = Vec::new();
        send_error(&mut out, 502, "Bad Gateway").await.unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
        );
    }
}
