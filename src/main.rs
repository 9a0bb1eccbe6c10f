mod catalog;
mod compare;
mod config;
mod error;
mod http;
mod model;
mod sandbox;
mod service;
mod session;
mod validator;

use crate::catalog::LevelCatalog;
use crate::config::Config;
use crate::http::AppState;
use crate::sandbox::SandboxPool;
use crate::service::QueryService;
use crate::session::MemorySessionStore;
use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("invalid log filter")?;
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let catalog = match &config.levels {
        Some(path) => LevelCatalog::from_json_file(path)
            .with_context(|| format!("loading levels from {}", path.display()))?,
        None => LevelCatalog::builtin(),
    };
    info!(levels = catalog.len(), "level catalog loaded");

    let pool = SandboxPool::new(config.sandbox_settings(), Handle::current());
    let service = QueryService::new(Arc::new(catalog), pool, config.query_timeout());
    let state = AppState {
        service: Arc::new(service),
        sessions: Arc::new(MemorySessionStore::new()),
    };

    let listener = TcpListener::bind(config.listen).await?;
    let local_addr = listener.local_addr()?;
    eprintln!("sqlquest listening on {local_addr}");
    info!(
        ttl_secs = config.sandbox_ttl_secs,
        query_timeout_ms = config.query_timeout_ms,
        "server started"
    );

    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await?;
    info!("server stopped");
    Ok(())
}
