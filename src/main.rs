use clap::Parser;
use forkproxy::config::{Cli, ProxyConfig};
use forkproxy::connection::{handle_client, Shared};
use forkproxy::tls::TlsIdentity;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            error!("{msg}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), String> {
    let config = ProxyConfig::from_cli(cli)?;

    let tls_identity = match &config.connect_mode {
        forkproxy::config::ConnectMode::Mitm {
            cert_file,
            key_file,
        } => Some(
            TlsIdentity::load(cert_file, key_file).map_err(|e| e.to_string())?,
        ),
        forkproxy::config::ConnectMode::OpaqueTunnel => None,
    };

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .map_err(|e| format!("bind {}: {e}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "listening");

    let shared = Arc::new(Shared::new(
        config.limits.clone(),
        config.connect_mode.clone(),
        tls_identity,
    ));

    #[cfg(unix)]
    {
        // SIGPIPE default action is ignored under tokio already; listen for
        // SIGINT to drain and exit 0 (§6).
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .map_err(|e| e.to_string())?;

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted.map_err(|e| e.to_string())?;
                    let shared = shared.clone();
                    tokio::spawn(async move { handle_client(stream, addr, shared).await });
                }
                _ = sigint.recv() => {
                    info!("received SIGINT, shutting down");
                    return Ok(());
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        loop {
            let (stream, addr) = listener.accept().await.map_err(|e| e.to_string())?;
            let shared = shared.clone();
            tokio::spawn(async move { handle_client(stream, addr, shared).await });
        }
    }
}
