// Main entry point - Dependency injection and server setup
mod application;
mod domain;
mod infrastructure;
mod presentation;

use std::{net::SocketAddr, sync::Arc, time::Duration};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::application::catalog::DashboardCatalog;
use crate::application::refresh_coordinator::SystemClock;
use crate::infrastructure::clickhouse_executor::ClickHouseExecutor;
use crate::infrastructure::config::{load_dashboards, load_server_config};
use crate::presentation::app_state::AppState;
use crate::presentation::handlers::routes;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,dbadmin_dashboard=debug")),
        )
        .init();

    // Load configuration
    let config = load_server_config()?;
    let dashboards = load_dashboards(&config.dashboards.dir)?;
    tracing::info!(count = dashboards.len(), dir = %config.dashboards.dir, "Loaded dashboards");

    // Query executor (infrastructure layer)
    let timeout = (config.clickhouse.timeout_secs > 0).then(|| Duration::from_secs(config.clickhouse.timeout_secs));
    let executor = Arc::new(ClickHouseExecutor::new(
        config.clickhouse.host,
        config.clickhouse.user,
        config.clickhouse.password,
        timeout,
    )?);

    // Catalog (application layer)
    let state = Arc::new(AppState {
        catalog: DashboardCatalog::new(dashboards, executor, Arc::new(SystemClock)),
    });

    // Responses are compressed per request, so no CompressionLayer here.
    let router = routes(state).layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.server.bind.parse()?;
    tracing::info!(%addr, "Starting dashboard service");

    axum::serve(tokio::net::TcpListener::bind(addr).await?, router).await?;

    Ok(())
}
