//! Proxy server: TCP listener, connection dispatch, and lifecycle.
//!
//! Startup is split in two so that privileges can be dropped in between:
//! [`ProxyServer::bind`] binds the socket and loads TLS material,
//! [`ProxyServer::spawn`] starts accepting. Each accepted connection gets
//! its own task which reads the request head and hands it to [`dispatch`].
//!
//! CONNECT method -> [`connect`] tunnel
//! Other methods  -> [`forward`] handler

use crate::config::{ListenerConfig, Scheme};
use crate::connect;
use crate::credential::CredentialSet;
use crate::error::{ProxyError, Result};
use crate::forward;
use crate::http::{self, RequestHead, MAX_HEADER_SIZE};
use crate::stream::ClientStream;
use crate::{auth, tls};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

/// Per-request view of the shared server state handed to the handlers.
pub struct ProxyCtx<'a> {
    /// Accepted credentials (empty = no auth)
    pub credentials: &'a CredentialSet,
    /// Shared TLS connector for `https://` forward targets
    pub tls_connector: &'a TlsConnector,
    /// Upstream connect / handshake timeout
    pub connect_timeout: Duration,
    /// Relay idle timeout
    pub idle_timeout: Duration,
}

impl<'a> ProxyCtx<'a> {
    #[must_use]
    pub fn new(
        credentials: &'a CredentialSet,
        tls_connector: &'a TlsConnector,
        connect_timeout: Duration,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            credentials,
            tls_connector,
            connect_timeout,
            idle_timeout,
        }
    }
}

/// Handle returned when the proxy server starts.
///
/// Drop the handle or call `shutdown()` to stop accepting connections.
/// Connections already accepted run to completion.
pub struct ProxyHandle {
    /// The address the proxy is listening on
    pub local_addr: SocketAddr,
    /// Send `true` to stop the accept loop
    shutdown_tx: watch::Sender<bool>,
    accept_task: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    /// The actual port the proxy is listening on.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Signal the proxy to stop accepting.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for the accept loop to exit.
    pub async fn join(self) {
        if let Err(e) = self.accept_task.await {
            warn!("Accept loop ended abnormally: {}", e);
        }
    }
}

/// Shared state for the proxy server.
struct ProxyState {
    config: ListenerConfig,
    tls_acceptor: Option<TlsAcceptor>,
    /// Created once at startup to avoid rebuilding the root cert store per request.
    tls_connector: TlsConnector,
    /// Active connection count for connection limiting.
    active_connections: AtomicUsize,
}

impl ProxyState {
    fn ctx(&self) -> ProxyCtx<'_> {
        ProxyCtx::new(
            &self.config.credentials,
            &self.tls_connector,
            self.config.connect_timeout,
            self.config.idle_timeout,
        )
    }
}

/// A bound but not yet accepting proxy server.
pub struct ProxyServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: Arc<ProxyState>,
}

impl ProxyServer {
    /// Bind the listening socket and load all TLS material.
    ///
    /// Everything that may need elevated privileges happens here.
    pub async fn bind(config: ListenerConfig) -> Result<Self> {
        config.validate()?;

        let tls_acceptor = match config.scheme {
            Scheme::Https => Some(tls::acceptor(&config.cert_path, &config.key_path)?),
            Scheme::Http => None,
        };
        let tls_connector = tls::connector()?;

        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(|e| ProxyError::Bind {
                addr: config.listen_addr.to_string(),
                source: e,
            })?;
        let local_addr = listener.local_addr().map_err(|e| ProxyError::Bind {
            addr: config.listen_addr.to_string(),
            source: e,
        })?;

        info!("Proxy server listening on {}://{}", config.scheme, local_addr);
        if config.credentials.is_empty() {
            warn!("No credentials configured, authentication is disabled");
        } else {
            info!("Basic authentication enabled for {} user(s)", config.credentials.len());
        }

        Ok(Self {
            listener,
            local_addr,
            state: Arc::new(ProxyState {
                config,
                tls_acceptor,
                tls_connector,
                active_connections: AtomicUsize::new(0),
            }),
        })
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start the accept loop as a task within the current runtime.
    pub fn spawn(self) -> ProxyHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(self.listener, self.state, shutdown_rx));

        ProxyHandle {
            local_addr: self.local_addr,
            shutdown_tx,
            accept_task,
        }
    }
}

/// Bind and start the proxy in one step.
pub async fn start(config: ListenerConfig) -> Result<ProxyHandle> {
    Ok(ProxyServer::bind(config).await?.spawn())
}

/// Accept loop: listen for connections until shutdown.
async fn accept_loop(
    listener: TcpListener,
    state: Arc<ProxyState>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let max = state.config.max_connections;
                        if let Err(current) = reserve_slot(&state.active_connections, max) {
                            warn!("Connection limit reached ({}/{}), rejecting {}", current, max, addr);
                            drop(stream);
                            continue;
                        }

                        debug!("Accepted connection from {}", addr);
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, &state).await {
                                debug!("Connection handler error ({}): {}", addr, e);
                            }
                            state.active_connections.fetch_sub(1, Ordering::AcqRel);
                        });
                    }
                    Err(e) => {
                        warn!("Accept error: {}", e);
                    }
                }
            }
            changed = shutdown_rx.changed() => {
                // A dropped handle counts as shutdown.
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Proxy server shutting down");
                    return;
                }
            }
        }
    }
}

/// Take one connection slot. Check and increment are a single atomic
/// step, so the limit holds even with several acceptors. `max == 0` means
/// unlimited. On refusal returns the current count.
fn reserve_slot(active: &AtomicUsize, max: usize) -> std::result::Result<usize, usize> {
    active.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
        (max == 0 || current < max).then_some(current + 1)
    })
}

/// Complete the TLS handshake if the listener is TLS-terminated.
async fn serve_connection(stream: TcpStream, state: &ProxyState) -> Result<()> {
    match &state.tls_acceptor {
        Some(acceptor) => {
            let tls_stream =
                match tokio::time::timeout(state.config.connect_timeout, acceptor.accept(stream))
                    .await
                {
                    Ok(Ok(s)) => s,
                    Ok(Err(e)) => return Err(ProxyError::Io(e)),
                    Err(_) => {
                        debug!("TLS handshake timed out");
                        return Ok(());
                    }
                };
            handle_connection(tls_stream, state).await
        }
        None => handle_connection(stream, state).await,
    }
}

/// Handle a single client connection: read the request head, then dispatch.
async fn handle_connection<S>(stream: S, state: &ProxyState) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    // The BufReader stays wrapped around the stream for the whole
    // connection so bytes read ahead of the head are not lost.
    let mut client = BufReader::new(stream);

    let read = tokio::time::timeout(
        state.config.header_timeout,
        http::read_request_head(&mut client, MAX_HEADER_SIZE),
    )
    .await;

    let head = match read {
        Ok(Ok(Some(head))) => head,
        Ok(Ok(None)) => return Ok(()), // Client disconnected
        Ok(Err(e @ ProxyError::HeaderTooLarge { .. })) => {
            http::send_error(&mut client, 431, "Request Header Fields Too Large").await?;
            return Err(e);
        }
        Ok(Err(e @ ProxyError::HttpParse(_))) => {
            http::send_error(&mut client, 400, "Bad Request").await?;
            return Err(e);
        }
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            debug!("Timed out waiting for request head");
            return Ok(());
        }
    };

    let result = dispatch(&head, &mut client, &state.ctx()).await;
    let _ = client.shutdown().await;
    result
}

/// Route one request: authentication gate first, then CONNECT to the
/// tunnel engine and everything else to the forward handler.
pub async fn dispatch<C>(head: &RequestHead, client: &mut C, ctx: &ProxyCtx<'_>) -> Result<()>
where
    C: ClientStream,
{
    if !auth::authorize(head, ctx.credentials, client).await? {
        return Err(ProxyError::AuthRequired);
    }

    if head.is_connect() {
        connect::tunnel(client, &head.target, ctx).await.map(|_| ())
    } else {
        forward::forward(head, client, ctx).await
    }
}
