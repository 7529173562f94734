mod auth;
mod config;
mod credentials;
mod health;
mod http;
mod metrics;
mod server;
mod tls;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::auth::allowlist::AllowList;
use crate::config::Config;
use crate::credentials::ecr::{self, EcrAuthorizationSource};
use crate::credentials::CredentialManager;
use crate::metrics::MetricsRegistry;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "ecr-proxy", about = "TLS reverse proxy for AWS ECR")]
struct Cli {
    /// Path to an optional YAML configuration file.  Environment variables
    /// take precedence over it.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers and background tasks.
#[derive(Clone)]
pub struct AppState {
    pub credentials: Arc<CredentialManager>,
    /// `None` when no allow-list is configured; every client is admitted.
    pub allow_list: Option<Arc<AllowList>>,
    pub http_client: reqwest::Client,
    pub metrics: MetricsRegistry,
}

// ---------------------------------------------------------------------------
// Registry credentials
// ---------------------------------------------------------------------------

async fn build_credentials(config: &Config) -> Result<Arc<CredentialManager>> {
    let sdk_config = ecr::load_sdk_config(&config.aws.region).await;

    let account_id = match &config.aws.account_id {
        Some(id) => id.clone(),
        None => {
            let id = ecr::resolve_account_id(&sdk_config)
                .await
                .context("AWS_ACCOUNT_ID is not set and could not be determined via STS")?;
            tracing::info!(account_id = %id, "AWS_ACCOUNT_ID not set, using STS caller identity");
            id
        }
    };

    let source = Arc::new(EcrAuthorizationSource::new(&sdk_config, account_id));
    let manager = CredentialManager::new(source)
        .await
        .context("failed to obtain a valid ECR authorization token")?;
    Ok(Arc::new(manager))
}

fn build_allow_list(config: &Config) -> Option<Arc<AllowList>> {
    if !config.access.is_enabled() {
        tracing::info!("no IP allow-list configured, registry path is open");
        return None;
    }
    let allow_list = AllowList::parse(&config.access.ip_whitelist);
    if allow_list.is_empty() {
        tracing::warn!("IP allow-list has no valid entries, every registry request will be denied");
    } else {
        tracing::info!(entries = allow_list.len(), "IP allow-list enabled");
    }
    Some(Arc::new(allow_list))
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow!("failed to install rustls crypto provider"))?;

    // ---- Config ----
    let config = config::load_config(cli.config.as_deref())?;
    tracing::info!(
        region = %config.aws.region,
        port = config.proxy.port,
        "starting ecr-proxy"
    );

    // ---- Credentials ----
    let credentials = build_credentials(&config).await?;

    // ---- TLS ----
    tls::ensure_certificates(&config.tls)?;
    let acceptor = tls::build_acceptor(&config.tls)?;

    // ---- App state ----
    let metrics = MetricsRegistry::new();
    let state = AppState {
        credentials: Arc::clone(&credentials),
        allow_list: build_allow_list(&config),
        http_client: http::forward::build_client()?,
        metrics: metrics.clone(),
    };

    // ---- Background refresh ----
    let shutdown = CancellationToken::new();
    let refresher = tokio::spawn(credentials::refresher::run_periodic_refresh(
        Arc::clone(&credentials),
        Duration::from_secs(config.credentials.refresh_interval_secs),
        metrics,
        shutdown.clone(),
    ));

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    // ---- HTTPS server ----
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.proxy.port))
        .await
        .with_context(|| format!("failed to bind HTTPS listener on port {}", config.proxy.port))?;
    tracing::info!(
        port = config.proxy.port,
        registry = %credentials.current_endpoint(),
        "HTTPS ECR proxy listening"
    );

    let served = server::serve_tls(
        listener,
        acceptor,
        http::handler::create_router(Arc::new(state)),
        shutdown.clone(),
        Duration::from_secs(config.proxy.shutdown_timeout_secs),
    )
    .await;

    shutdown.cancel();
    if let Err(e) = refresher.await {
        tracing::error!(error = %e, "credential refresh task failed");
    }
    served?;

    tracing::info!("ecr-proxy shut down cleanly");
    Ok(())
}
