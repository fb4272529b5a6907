// SPDX-License-Identifier: Apache-2.0
//! The WebSocket boundary — upgrade endpoint, read-only status
//! endpoints, CORS, and graceful shutdown for the live audience-reaction
//! hub.

mod routes;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use clap::Parser;
use reaction_hub::{spawn_aggregator, Hub};
use reaction_persistence::Persistence;
use reaction_store::Store;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Shared application state handed to every axum handler.
#[derive(Clone)]
pub struct AppState {
    /// Per-user sliding-window sample store.
    pub store: Arc<Store>,
    /// Append-only durable log.
    pub persistence: Arc<Persistence>,
    /// Live-connection registry and fan-out.
    pub hub: Arc<Hub>,
    /// Resolved `DATABASE_URL`, echoed by `/`.
    pub database_url: String,
    /// Process start time, for uptime reporting.
    pub started_at: Instant,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Audience-reaction aggregation hub")]
struct Args {
    /// SQLite connection string. Defaults to a local file store.
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://reactions.db")]
    database_url: String,
    /// Allowed CORS origin for the frontend.
    #[arg(long, env = "FRONTEND_URL", default_value = "http://localhost:3000")]
    frontend_url: String,
    /// TCP port to listen on.
    #[arg(long, env = "PORT", default_value_t = 8001)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args = Args::parse();

    let persistence = Persistence::open(&args.database_url).context("open persistence")?;
    let state = AppState {
        store: Arc::new(Store::new()),
        persistence: Arc::new(persistence),
        hub: Arc::new(Hub::new()),
        database_url: args.database_url.clone(),
        started_at: Instant::now(),
    };

    let shutdown_token = CancellationToken::new();
    let aggregator = spawn_aggregator(
        state.store.clone(),
        state.hub.clone(),
        state.persistence.clone(),
        shutdown_token.clone(),
    );

    let cors = if args.frontend_url == "*" {
        CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
    } else {
        let origin: axum::http::HeaderValue = args
            .frontend_url
            .parse()
            .context("FRONTEND_URL is not a valid header value")?;
        CorsLayer::new().allow_origin(origin).allow_methods(Any).allow_headers(Any)
    };

    let hub_for_shutdown = state.hub.clone();

    let app = Router::new()
        .route("/", get(routes::root))
        .route("/status", get(routes::status))
        .route("/debug/aggregation", get(routes::debug_aggregation))
        .route("/debug/database", get(routes::debug_database))
        .route("/ws", get(ws::ws_handler))
        .layer(cors)
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr).await.context("bind listener")?;
    info!(%addr, "reaction hub listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(shutdown_token, hub_for_shutdown))
        .await
        .context("serve")?;

    // By the time `serve` resolves, the shutdown signal already tripped the
    // token above, so the aggregator has stopped (or is about to) on its own.
    if let Err(err) = aggregator.await {
        tracing::warn!(%err, "aggregator task did not shut down cleanly");
    }
    info!("shutdown complete");
    Ok(())
}

/// Waits for Ctrl-C, then signals every live connection and the Aggregator
/// to stop. `axum`'s graceful shutdown only stops accepting new upgrades; the
/// cancellation here is what makes already-upgraded connections close
/// promptly with a normal-closure frame instead of idling out.
async fn shutdown_signal(shutdown_token: CancellationToken, hub: Arc<Hub>) {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::warn!("failed to install ctrl-c handler; shutting down anyway");
    }
    info!("shutdown signal received");
    shutdown_token.cancel();
    hub.close_all();
}
