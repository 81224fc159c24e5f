mod error;
mod handlers;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use governance::GovernanceConfig;
use orchestrator::{cancellation, http_backends, spawn_sweeper, HttpBackendConfig};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::handlers::*;
use crate::state::{build_gateway, create_default_config, AppState};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[arg(long, default_value = "relay.toml")]
    config: PathBuf,
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    if !args.config.exists() {
        warn!(path = %args.config.display(), "config file missing, creating default config");
        create_default_config(&args.config)?;
    }

    let config = GovernanceConfig::load(&args.config)?;
    let backends = http_backends(&config.providers, &HttpBackendConfig::default())?;
    if backends.is_empty() {
        warn!("no backend endpoints configured; every turn will fail");
    }
    let gateway = Arc::new(build_gateway(&config, backends)?);

    let (stop_sweeper, sweeper_signal) = cancellation();
    let sweeper = spawn_sweeper(
        gateway.auth().clone(),
        gateway.rate().clone(),
        gateway.sessions().clone(),
        config.rate_limit.sweep_interval(),
        config.sessions.sweep_interval(),
        sweeper_signal,
    );

    let state = Arc::new(AppState::new(
        gateway.clone(),
        config.auth.admin_token.clone(),
    ));

    let admin_routes = Router::new()
        .route("/audit", get(list_audit))
        .route("/providers/health", get(provider_health))
        .route("/tokens", post(issue_token))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth));

    let app = Router::new()
        .route("/v1/turns", post(submit_turn))
        .route("/v1/sessions/close", post(close_session))
        .nest("/api", admin_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("relay-server listening on {}", args.listen);
    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    stop_sweeper.cancel();
    if let Err(err) = sweeper.await {
        warn!(error = %err, "sweeper task ended abnormally");
    }
    gateway.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
