//! Credential loading for the authentication gate.
//!
//! Credentials come from a single operator-supplied string of
//! `user:password` pairs separated by `;`. Parsing is permissive: tokens
//! that do not split into exactly two parts, or whose username is empty,
//! are dropped without failing startup. An empty set disables
//! authentication entirely.

use crate::auth;
use tracing::debug;
use zeroize::Zeroizing;

/// A single username/password pair.
#[derive(Clone)]
pub struct Credential {
    pub username: String,
    pub password: Zeroizing<String>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Ordered, read-only set of credentials, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct CredentialSet {
    entries: Vec<Credential>,
}

impl CredentialSet {
    /// Parse a `user:password;user2:password2` list.
    #[must_use]
    pub fn load(raw: &str) -> Self {
        let mut entries = Vec::new();

        for token in raw.split(';') {
            let parts: Vec<&str> = token.split(':').collect();
            match parts.as_slice() {
                [user, password] if !user.is_empty() => entries.push(Credential {
                    username: (*user).to_string(),
                    password: Zeroizing::new((*password).to_string()),
                }),
                _ if token.is_empty() => {}
                _ => debug!("Skipping malformed credential entry"),
            }
        }

        Self { entries }
    }

    /// Create an empty set (authentication disabled).
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Check if any credentials are loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of loaded credentials.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Iterate over the loaded credentials in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = &Credential> {
        self.entries.iter()
    }

    /// Exact, case-sensitive match of both fields against every entry.
    #[must_use]
    pub fn contains(&self, username: &str, password: &str) -> bool {
        self.entries.iter().any(|c| {
            c.username == username
                && auth::constant_time_eq(c.password.as_bytes(), password.as_bytes())
        })
    }
}
