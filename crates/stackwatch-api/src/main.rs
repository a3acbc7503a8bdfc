//! Stackwatch server: trigger webhook, read API, dispatcher and reaper.

use anyhow::Context;
use clap::Parser;
use stackwatch_api::{AppState, routes};
use stackwatch_config::{LogFormat, resolve_system_config};
use stackwatch_scheduler::Supervisor;
use stackwatch_store::RecordStore;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stackwatch-server")]
#[command(about = "Build supervisor for project stacks")]
#[command(version)]
struct Args {
    /// Configuration file
    #[arg(short, long, env = "STACKWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address (overrides the config file)
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Log output format: text or json
    #[arg(long)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config =
        resolve_system_config(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(format) = args.log_format {
        config.log_format = format;
    }

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }

    let store = Arc::new(RecordStore::new(config.pending_dir(), config.archive_dir()));
    store
        .ensure_layout()
        .await
        .context("Failed to create data directories")?;
    info!(
        data_dir = %config.data_dir.display(),
        projects = %config.projects_root.display(),
        "Store ready"
    );

    let supervisor = Supervisor::start(
        Supervisor::runner_for(&config, store.clone()),
        config.reaper_interval,
    );

    // Build router
    let app = routes::router(AppState::new(&config, store))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // Start server
    info!("Starting server on {}", config.listen);
    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    supervisor.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutting down");
}
