mod cli;
mod config;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use ws_relay::{Proxy, ProxyConfig};

use crate::cli::Cli;
use crate::config::LogFormat;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Parse CLI args (PORT and ELEVENLABS_API_KEY arrive through clap's env support).
    let cli = Cli::parse();

    // 2. Load config, then merge CLI overrides.
    let mut cfg = config::load(&cli.config)?;

    if let Some(port) = cli.port {
        cfg.network.port = port;
    }
    if let Some(ref host) = cli.listen_host {
        cfg.network.listen_host = host.clone();
    }
    if let Some(ref endpoint) = cli.signed_url_endpoint {
        cfg.upstream.signed_url_endpoint = endpoint.clone();
    }

    // 3. Init tracing-subscriber; RUST_LOG wins over the configured level.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.logging.level));

    match cfg.logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init(),
    }

    let listen_addr = cfg.network.listen_addr()?;
    let api_key = cli.api_key.filter(|key| !key.is_empty());

    info!(
        config_file = %cli.config.display(),
        listen = %listen_addr,
        signed_url_endpoint = %cfg.upstream.signed_url_endpoint,
        api_key_configured = api_key.is_some(),
        "convai-proxy starting"
    );
    if api_key.is_none() {
        warn!("ELEVENLABS_API_KEY is not set; relay connections will be rejected");
    }

    // 4. Build the relay.
    let proxy = Proxy::new(ProxyConfig {
        listen_addr,
        service_name: cfg.service.name.clone(),
        api_key,
        signed_url_endpoint: cfg.upstream.signed_url_endpoint.clone(),
        fetch_timeout: cfg.upstream.fetch_timeout(),
        connect_timeout: cfg.upstream.connect_timeout(),
    })
    .context("failed to build relay")?;

    // 5. Serve until ctrl-c or SIGTERM.
    proxy
        .run(shutdown_signal())
        .await
        .context("relay server failed")?;

    info!("convai-proxy shut down");
    Ok(())
}

/// Resolves on SIGINT (ctrl-c) or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(%err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        let sigterm = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(err) => {
                    warn!(%err, "failed to register SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            _ = ctrl_c => info!("received SIGINT (ctrl-c)"),
            _ = sigterm => info!("received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
        info!("received SIGINT (ctrl-c)");
    }
}
