//! Hop-by-hop header hygiene.
//!
//! Headers that only make sense between adjacent peers must not be copied
//! across the proxy. The filter holds a fixed deny set and, per message,
//! also drops any header named in that message's `Connection` header.

use crate::http::Header;
use std::collections::HashSet;

/// Headers that are always connection-scoped.
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Deny-set header filter, evaluated per message.
#[derive(Debug, Clone)]
pub struct HeaderFilter {
    deny: HashSet<String>,
}

impl Default for HeaderFilter {
    fn default() -> Self {
        Self::hop_by_hop()
    }
}

impl HeaderFilter {
    /// Filter dropping the standard hop-by-hop headers.
    #[must_use]
    pub fn hop_by_hop() -> Self {
        Self {
            deny: HOP_BY_HOP.iter().map(|h| (*h).to_string()).collect(),
        }
    }

    /// Also drop `name` from every message.
    #[must_use]
    pub fn deny(mut self, name: &str) -> Self {
        self.deny.insert(name.to_ascii_lowercase());
        self
    }

    /// Whether `name` is in the fixed deny set.
    #[must_use]
    pub fn is_denied(&self, name: &str) -> bool {
        self.deny.contains(&name.to_ascii_lowercase())
    }

    /// Headers of one message that may be forwarded, in original order.
    #[must_use]
    pub fn apply(&self, headers: &[Header]) -> Vec<Header> {
        let listed = connection_tokens(headers);
        headers
            .iter()
            .filter(|(name, _)| {
                let lower = name.to_ascii_lowercase();
                !self.deny.contains(&lower) && !listed.contains(&lower)
            })
            .cloned()
            .collect()
    }
}

/// Lowercased header names listed in `Connection` (and the legacy
/// `Proxy-Connection`) headers of a message.
#[must_use]
pub fn connection_tokens(headers: &[Header]) -> HashSet<String> {
    headers
        .iter()
        .filter(|(name, _)| {
            name.eq_ignore_ascii_case("connection") || name.eq_ignore_ascii_case("proxy-connection")
        })
        .flat_map(|(_, value)| {
            String::from_utf8_lossy(value)
                .split(',')
                .map(|token| token.trim().to_ascii_lowercase())
                .collect::<Vec<_>>()
        })
        .filter(|token| !token.is_empty())
        .collect()
}
