//! Forward HTTP/HTTPS proxy engine.
//!
//! `hopgate-proxy` accepts HTTP/1.1 proxy requests on a plain or
//! TLS-terminated listener and serves them in one of two modes:
//!
//! 1. **CONNECT tunnel** (`connect`) - Opaque byte relay to `host:port`.
//!    The proxy answers `200 Connection Established` and then copies bytes
//!    in both directions until either side closes.
//!
//! 2. **Forward** (`forward`) - Absolute-form requests such as
//!    `GET http://host/path` are re-issued to the origin with hop-by-hop
//!    headers stripped, and the origin's response is streamed back.
//!
//! Every request first passes the Basic authentication gate (`auth`).
//! With no credentials configured the gate admits everything.

pub mod audit;
pub mod auth;
pub mod body;
pub mod config;
pub mod connect;
pub mod credential;
pub mod error;
pub mod forward;
pub mod headers;
pub mod http;
pub mod server;
pub mod stream;
pub mod tls;

pub use config::{ListenerConfig, Scheme};
pub use credential::CredentialSet;
pub use error::{ProxyError, Result};
pub use server::{start, ProxyHandle, ProxyServer};
