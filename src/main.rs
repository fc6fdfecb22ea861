mod cache;
mod cli;
mod config;
mod discovery;
mod domain_phrases;
mod embeddings;
mod error;
mod finder;
mod health;
mod logging;
mod orchestrator;
mod patcher;
mod pool;
mod profile;
mod router;
mod schema;
mod secrets;
mod server;
mod tool;
mod transport;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rmcp::ServiceExt;
use rmcp::transport::stdio;
use tracing::{info, warn};

use crate::orchestrator::Orchestrator;
use crate::server::MuxServer;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    // Must run before config load: `${VAR}` interpolation and env-backed
    // secret fallback both read from the process environment.
    config::load_dotenv();

    let home = cli::mcpmux_home();
    if !home.exists() {
        std::fs::create_dir_all(&home).context("creating mcpmux home directory")?;
    }

    let mut config = config::Config::load(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;

    logging::init(&config.log_level, config.debug_logging);

    config
        .resolve_secrets_async()
        .await
        .context("resolving secrets in config")?;

    info!(
        config_path = %cli.config.display(),
        backends = config.backends.len(),
        "mcpmux starting"
    );

    let config_path = cli.config.clone();
    let orchestrator = Orchestrator::start(config.clone(), config_path).await?;

    #[cfg(feature = "http-upstream")]
    if config.upstream.http_enabled {
        spawn_http_upstream(&config, Arc::clone(&orchestrator));
    }

    let server = MuxServer::new(orchestrator.clone());
    info!("serving MCP over stdio");
    let service = server.serve(stdio()).await?;

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

        tokio::select! {
            result = service.waiting() => {
                if let Err(e) = result {
                    warn!(error = %e, "MCP service exited with error");
                }
            }
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        service.waiting().await?;
    }

    info!("shutting down");
    orchestrator.shutdown().await;

    Ok(())
}

#[cfg(feature = "http-upstream")]
fn spawn_http_upstream(config: &config::Config, orchestrator: std::sync::Arc<Orchestrator>) {
    use rmcp::transport::streamable_http_server::{
        StreamableHttpService, session::local::LocalSessionManager,
    };

    let listen = config.upstream.listen.clone();
    tokio::spawn(async move {
        let service = StreamableHttpService::new(
            move || Ok(MuxServer::new(orchestrator.clone())),
            LocalSessionManager::default().into(),
            Default::default(),
        );
        let router = axum::Router::new().nest_service("/mcp", service);
        match tokio::net::TcpListener::bind(&listen).await {
            Ok(listener) => {
                info!(listen, "serving MCP over streamable HTTP");
                if let Err(e) = axum::serve(listener, router).await {
                    warn!(error = %e, "http upstream server exited with error");
                }
            }
            Err(e) => warn!(listen, error = %e, "failed to bind http upstream listener"),
        }
    });
}
