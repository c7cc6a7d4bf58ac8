//! HTTP Basic authentication gate.
//!
//! With an empty [`CredentialSet`] every request passes. Otherwise the
//! request must carry `Basic base64(user:password)` credentials matching a
//! configured pair, in `Proxy-Authorization` or, for clients that treat the
//! proxy as an origin, in `Authorization`. Failures get a 401 challenge and
//! are not dispatched further.

use crate::audit;
use crate::credential::CredentialSet;
use crate::error::Result;
use crate::http::{self, RequestHead};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use subtle::ConstantTimeEq;
use tokio::io::AsyncWrite;
use zeroize::Zeroizing;

/// Challenge sent with every 401.
pub const BASIC_CHALLENGE: &str = "Basic realm=\"hopgate\"";

/// Headers searched for credentials, in order.
const AUTH_HEADERS: [&str; 2] = ["proxy-authorization", "authorization"];

/// Constant-time comparison of two byte strings.
///
/// Uses the `subtle` crate's `ConstantTimeEq` so that response timing does
/// not reveal how much of a password prefix matched.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Decode a `Basic <base64>` header value into (username, password).
///
/// Scheme matching is case-insensitive. Returns `None` for other schemes,
/// bad base64, non-UTF-8 payloads or a payload without a colon.
#[must_use]
pub fn decode_basic(value: &str) -> Option<(String, Zeroizing<String>)> {
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }

    let decoded = Zeroizing::new(STANDARD.decode(encoded.trim()).ok()?);
    let decoded_str = std::str::from_utf8(&decoded).ok()?;
    let (user, password) = decoded_str.split_once(':')?;
    Some((user.to_string(), Zeroizing::new(password.to_string())))
}

/// Pure authorization decision, no I/O.
#[must_use]
pub fn is_authorized(head: &RequestHead, credentials: &CredentialSet) -> bool {
    if credentials.is_empty() {
        return true;
    }

    head.headers
        .iter()
        .filter(|(name, _)| AUTH_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)))
        .filter_map(|(_, value)| std::str::from_utf8(value).ok().and_then(decode_basic))
        .any(|(user, password)| credentials.contains(&user, &password))
}

/// Run the gate. On failure writes the 401 challenge and returns
/// `Ok(false)`; the caller must not dispatch the request.
pub async fn authorize<W>(
    head: &RequestHead,
    credentials: &CredentialSet,
    client: &mut W,
) -> Result<bool>
where
    W: AsyncWrite + Unpin,
{
    if is_authorized(head, credentials) {
        return Ok(true);
    }

    audit::log_auth_denied(&head.method, &head.target);
    http::send_response(
        client,
        401,
        "Unauthorized",
        &[
            ("WWW-Authenticate", BASIC_CHALLENGE),
            ("Proxy-Authenticate", BASIC_CHALLENGE),
            ("Content-Length", "0"),
            ("Connection", "close"),
        ],
    )
    .await?;
    Ok(false)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn head_with(headers: &[(&str, &str)]) -> RequestHead {
        RequestHead {
            method: "GET".to_string(),
            target: "http://example.com/".to_string(),
            version: "HTTP/1.1".to_string(),
            headers: headers
                .iter()
                .map(|(n, v)| ((*n).to_string(), v.as_bytes().to_vec()))
                .collect(),
        }
    }

    fn basic(user_pass: &str) -> String {
        format!("Basic {}", STANDARD.encode(user_pass))
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"hello", b"hello"));
        assert!(!constant_time_eq(b"hello", b"world"));
        assert!(!constant_time_eq(b"hello", b"hi"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn test_decode_basic() {
        let (user, password) = decode_basic(&basic("alice:se:cret")).unwrap();
        assert_eq!(user, "alice");
        assert_eq!(password.as_str(), "se:cret");
    }

    #[test]
    fn test_decode_basic_case_insensitive_scheme() {
        let value = format!("BASIC {}", STANDARD.encode("a:b"));
        assert!(decode_basic(&value).is_some());
    }

    #[test]
    fn test_decode_basic_rejects_malformed() {
        assert!(decode_basic("Bearer abc").is_none());
        assert!(decode_basic("Basic !!!notbase64").is_none());
        assert!(decode_basic(&format!("Basic {}", STANDARD.encode("nocolon"))).is_none());
        assert!(decode_basic("Basic").is_none());
    }

    #[test]
    fn test_empty_set_allows_everything() {
        let creds = CredentialSet::empty();
        assert!(is_authorized(&head_with(&[]), &creds));
        assert!(is_authorized(
            &head_with(&[("Proxy-Authorization", basic("x:y").as_str())]),
            &creds
        ));
    }

    #[test]
    fn test_proxy_authorization_accepted() {
        let creds = CredentialSet::load("alice:secret");
        let head = head_with(&[("Proxy-Authorization", basic("alice:secret").as_str())]);
        assert!(is_authorized(&head, &creds));
    }

    #[test]
    fn test_authorization_header_accepted() {
        let creds = CredentialSet::load("alice:secret");
        let head = head_with(&[("authorization", basic("alice:secret").as_str())]);
        assert!(is_authorized(&head, &creds));
    }

    #[test]
    fn test_missing_or_wrong_credentials_rejected() {
        let creds = CredentialSet::load("alice:secret");
        assert!(!is_authorized(&head_with(&[]), &creds));
        assert!(!is_authorized(
            &head_with(&[("Proxy-Authorization", basic("alice:Secret").as_str())]),
            &creds
        ));
        assert!(!is_authorized(
            &head_with(&[("Proxy-Authorization", basic("ALICE:secret").as_str())]),
            &creds
        ));
        assert!(!is_authorized(
            &head_with(&[("Proxy-Authorization", "Bearer secret")]),
            &creds
        ));
    }

    #[tokio::test]
    async fn test_authorize_writes_challenge() {
        let creds = CredentialSet::load("alice:secret");
        let mut out = Vec::new();
        let allowed = authorize(&head_with(&[]), &creds, &mut out).await.unwrap();
        assert!(!allowed);

        let response = String::from_utf8(out).unwrap();
        assert!(response.starts_with("HTTP/1.1 401 Unauthorized\r\n"));
        assert!(response.contains("WWW-Authenticate: Basic realm=\"hopgate\"\r\n"));
    }

    #[tokio::test]
    async fn test_authorize_success_is_silent() {
        let creds = CredentialSet::load("alice:secret");
        let head = head_with(&[("Proxy-Authorization", basic("alice:secret").as_str())]);
        let mut out = Vec::new();
        assert!(authorize(&head, &creds, &mut out).await.unwrap());
        assert!(out.is_empty());
    }
}
