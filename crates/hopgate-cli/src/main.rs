//! hopgate CLI - forward HTTP/HTTPS proxy
//!
//! Binds the listener, drops privileges, and serves until interrupted.

mod cli;
mod privilege;

use clap::Parser;
use cli::Cli;
use hopgate_proxy::{ProxyError, ProxyServer, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_filter())),
        )
        .with_target(false)
        .init();

    if let Err(e) = run(cli) {
        error!("{}", e);
        eprintln!("hopgate: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = cli.listener_config()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| ProxyError::Config(format!("failed to start async runtime: {}", e)))?;

    runtime.block_on(async move {
        let (uid, gid) = (config.uid, config.gid);

        // Certificates are read and the port bound while still privileged.
        let server = ProxyServer::bind(config).await?;
        privilege::drop_privileges(uid, gid)?;

        let handle = server.spawn();
        wait_for_shutdown().await?;

        handle.shutdown();
        handle.join().await;
        info!("Stopped");
        Ok::<(), ProxyError>(())
    })
}

#[cfg(unix)]
async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = term.recv() => {}
    }
    info!("Shutdown signal received");
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    Ok(())
}
