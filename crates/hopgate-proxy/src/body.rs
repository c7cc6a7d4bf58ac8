//! Message body framing and streaming.
//!
//! Bodies are never buffered whole. The framing of each message decides
//! how many bytes belong to it; chunked bodies are relayed chunk by chunk
//! with their framing intact.

use crate::error::{ProxyError, Result};
use crate::http::{header_bytes, header_value, Header};
use crate::stream::{copy_with_idle_timeout, timed};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Longest chunk-size or trailer line accepted.
const MAX_CHUNK_LINE: u64 = 4096;

/// How the end of a message body is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body at all.
    Empty,
    /// Exactly this many bytes (`Content-Length`).
    Length(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// Everything until the sender closes (responses only).
    UntilClose,
}

/// Framing of a request body. Requests without length or chunking carry
/// no body.
pub fn request_framing(headers: &[Header]) -> Result<BodyFraming> {
    if is_chunked(headers) {
        return Ok(BodyFraming::Chunked);
    }
    match content_length(headers)? {
        Some(0) | None => Ok(BodyFraming::Empty),
        Some(len) => Ok(BodyFraming::Length(len)),
    }
}

/// Framing of a response body to a request made with `method`.
pub fn response_framing(
    method: &str,
    status: u16,
    headers: &[Header],
) -> Result<BodyFraming> {
    let bodiless_status = (100..200).contains(&status) || status == 204 || status == 304;
    if method.eq_ignore_ascii_case("HEAD") || bodiless_status {
        return Ok(BodyFraming::Empty);
    }
    if is_chunked(headers) {
        return Ok(BodyFraming::Chunked);
    }
    match content_length(headers)? {
        Some(0) => Ok(BodyFraming::Empty),
        Some(len) => Ok(BodyFraming::Length(len)),
        None => Ok(BodyFraming::UntilClose),
    }
}

fn is_chunked(headers: &[Header]) -> bool {
    header_value(headers, "transfer-encoding")
        .and_then(|v| v.split(',').next_back())
        .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
}

fn content_length(headers: &[Header]) -> Result<Option<u64>> {
    match header_bytes(headers, "content-length") {
        Some(value) => std::str::from_utf8(value)
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Some)
            .ok_or_else(|| {
                ProxyError::HttpParse(format!(
                    "invalid Content-Length: {}",
                    String::from_utf8_lossy(value)
                ))
            }),
        None => Ok(None),
    }
}

/// Stream one body from `reader` to `writer`. Returns the number of body
/// bytes moved (chunk framing excluded).
pub async fn copy_body<R, W>(
    reader: &mut R,
    writer: &mut W,
    framing: BodyFraming,
    idle: Duration,
) -> Result<u64>
where
    R: AsyncBufRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let copied = match framing {
        BodyFraming::Empty => 0,
        BodyFraming::Length(len) => copy_exact(reader, writer, len, idle).await?,
        BodyFraming::Chunked => copy_chunked(reader, writer, idle).await?,
        BodyFraming::UntilClose => {
            let mut copied = 0;
            copy_with_idle_timeout(reader, writer, idle, &mut copied).await?;
            copied
        }
    };
    writer.flush().await?;
    Ok(copied)
}

async fn copy_exact<R, W>(reader: &mut R, writer: &mut W, len: u64, idle: Duration) -> Result<u64>
where
    R: AsyncBufRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut copied = 0;
    let mut limited = (&mut *reader).take(len);
    copy_with_idle_timeout(&mut limited, writer, idle, &mut copied).await?;
    if copied != len {
        return Err(ProxyError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("body ended after {} of {} bytes", copied, len),
        )));
    }
    Ok(copied)
}

async fn copy_chunked<R, W>(reader: &mut R, writer: &mut W, idle: Duration) -> Result<u64>
where
    R: AsyncBufRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut total = 0;
    loop {
        let size_line = read_framing_line(reader, idle).await?;
        let size_hex = size_line
            .trim_end()
            .split(';')
            .next()
            .unwrap_or("")
            .trim();
        let size = u64::from_str_radix(size_hex, 16)
            .map_err(|_| ProxyError::HttpParse(format!("invalid chunk size: {:?}", size_hex)))?;
        writer.write_all(size_line.as_bytes()).await?;

        if size == 0 {
            // Trailer section, ends with a blank line.
            loop {
                let trailer = read_framing_line(reader, idle).await?;
                writer.write_all(trailer.as_bytes()).await?;
                if trailer.trim_end().is_empty() {
                    return Ok(total);
                }
            }
        }

        // Chunk data plus its CRLF.
        let framed = size
            .checked_add(2)
            .ok_or_else(|| ProxyError::HttpParse("chunk size overflow".to_string()))?;
        copy_exact(reader, writer, framed, idle).await?;
        total += size;
    }
}

async fn read_framing_line<R>(reader: &mut R, idle: Duration) -> Result<String>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut line = String::new();
    let n = timed(
        idle,
        "chunk read",
        (&mut *reader).take(MAX_CHUNK_LINE).read_line(&mut line),
    )
    .await
    .map_err(|e| {
        if e.kind() == std::io::ErrorKind::InvalidData {
            ProxyError::HttpParse("chunk line is not valid UTF-8".to_string())
        } else {
            ProxyError::Io(e)
        }
    })?;
    if n == 0 || !line.ends_with('\n') {
        return Err(ProxyError::HttpParse("truncated chunked body".to_string()));
    }
    Ok(line)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    const IDLE: Duration = Duration::from_secs(5);

    fn headers(pairs: &[(&str, &str)]) -> Vec<Header> {
        pairs
            .iter()
            .map(|(n, v)| ((*n).to_string(), v.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn test_request_framing() {
        assert_eq!(request_framing(&[]).unwrap(), BodyFraming::Empty);
        assert_eq!(
            request_framing(&headers(&[("Content-Length", "12")])).unwrap(),
            BodyFraming::Length(12)
        );
        assert_eq!(
            request_framing(&headers(&[
                ("Content-Length", "12"),
                ("Transfer-Encoding", "gzip, chunked"),
            ]))
            .unwrap(),
            BodyFraming::Chunked
        );
        assert!(request_framing(&headers(&[("Content-Length", "ten")])).is_err());
    }

    #[test]
    fn test_response_framing() {
        assert_eq!(
            response_framing("HEAD", 200, &headers(&[("Content-Length", "99")])).unwrap(),
            BodyFraming::Empty
        );
        assert_eq!(response_framing("GET", 304, &[]).unwrap(), BodyFraming::Empty);
        assert_eq!(response_framing("GET", 204, &[]).unwrap(), BodyFraming::Empty);
        assert_eq!(
            response_framing("GET", 200, &[]).unwrap(),
            BodyFraming::UntilClose
        );
        assert_eq!(
            response_framing("GET", 404, &headers(&[("content-length", "7")])).unwrap(),
            BodyFraming::Length(7)
        );
    }

    #[tokio::test]
    async fn test_copy_length_leaves_rest_unread() {
        let mut reader = BufReader::new(&b"hello world"[..]);
        let mut out = Vec::new();
        let n = copy_body(&mut reader, &mut out, BodyFraming::Length(5), IDLE)
            .await
            .unwrap();
        assert_eq!(n, 5);
        assert_eq!(out, b"hello");

        let mut rest = String::new();
        reader.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, " world");
    }

    #[tokio::test]
    async fn test_copy_length_short_body() {
        let mut reader = BufReader::new(&b"abc"[..]);
        let mut out = Vec::new();
        let err = copy_body(&mut reader, &mut out, BodyFraming::Length(10), IDLE)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Io(_)));
    }

    #[tokio::test]
    async fn test_copy_chunked_verbatim() {
        let raw = b"5;ext=1\r\nhello\r\n6\r\n world\r\n0\r\nX-Trailer: t\r\n\r\nNEXT";
        let mut reader = BufReader::new(&raw[..]);
        let mut out = Vec::new();
        let n = copy_body(&mut reader, &mut out, BodyFraming::Chunked, IDLE)
            .await
            .unwrap();
        assert_eq!(n, 11);
        assert_eq!(out, &raw[..raw.len() - 4]);

        let mut rest = String::new();
        reader.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "NEXT");
    }

    #[tokio::test]
    async fn test_copy_chunked_bad_size() {
        let mut reader = BufReader::new(&b"zz\r\nhello\r\n"[..]);
        let mut out = Vec::new();
        let err = copy_body(&mut reader, &mut out, BodyFraming::Chunked, IDLE)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::HttpParse(_)));
    }

    #[tokio::test]
    async fn test_copy_until_close() {
        let body = vec![b'x'; 20_000];
        let mut reader = BufReader::new(body.as_slice());
        let mut out = Vec::new();
        let n = copy_body(&mut reader, &mut out, BodyFraming::UntilClose, IDLE)
            .await
            .unwrap();
        assert_eq!(n, 20_000);
        assert_eq!(out, body);
    }
}
