//! Listeners for the message director.
//!
//! Participants connect over framed TCP. A small axum app serves health and
//! routing statistics for operators.

use crate::config::Config;
use crate::connection::serve_connection;
use crate::metrics;
use anyhow::{Context, Result};
use astron_core::{DirectorStats, MessageDirector};
use astron_transport::{TcpTransport, Transport};
use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// How often routing gauges are refreshed.
const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Serve participants and the admin endpoint. Only returns on startup failure.
///
/// # Errors
///
/// Returns an error if a listener cannot be bound.
pub async fn run_server(config: Config, director: Arc<MessageDirector>) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
        metrics::spawn_stats_reporter(&director, STATS_INTERVAL);
    }

    if config.admin.enabled {
        let addr = config.admin_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind admin endpoint on {}", addr))?;
        info!("Admin endpoint listening on http://{}", addr);
        let app = admin_router(director.clone());
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("Admin endpoint failed: {}", e);
            }
        });
    }

    let addr = config.bind_addr()?;
    let transport = TcpTransport::bind(addr, config.tcp_config())
        .await
        .with_context(|| format!("Failed to bind participant listener on {}", addr))?;
    info!("Message director listening on {}", addr);

    accept_loop(transport, director).await
}

async fn accept_loop(transport: impl Transport, director: Arc<MessageDirector>) -> Result<()> {
    loop {
        match transport.accept().await {
            Ok(conn) => {
                tokio::spawn(serve_connection(conn, director.clone()));
            }
            Err(e) => {
                warn!(transport = transport.name(), error = %e, "Accept failed");
                metrics::record_error("accept");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Build the admin HTTP app.
pub fn admin_router(director: Arc<MessageDirector>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .with_state(director)
}

/// Health check handler.
async fn health_handler(State(director): State<Arc<MessageDirector>>) -> impl IntoResponse {
    let upstream_lost = director.upstream().is_some_and(|link| link.is_lost());
    Json(serde_json::json!({
        "status": if upstream_lost { "degraded" } else { "ok" },
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn stats_handler(State(director): State<Arc<MessageDirector>>) -> Json<DirectorStats> {
    Json(director.stats())
}
