use std::net::SocketAddr;
use std::sync::Arc;

use cadence_core::config::CadenceConfig;
use cadence_scheduler::{Scheduler, SqliteJobStore};
use tracing::{info, warn};

mod app;
mod http;
mod runtime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "cadence_gateway=info,cadence_scheduler=info,tower_http=debug".into()
            }),
        )
        .init();

    // load config: CADENCE_CONFIG env > ~/.cadence/cadence.toml
    let config_path = std::env::var("CADENCE_CONFIG").ok();
    let config = CadenceConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        CadenceConfig::default()
    });

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");
    let store = SqliteJobStore::open(db_path)?
        .with_run_history_limit(config.scheduler.run_history_limit);

    let runtime = runtime::build_runtime(&config.runtime)?;
    let scheduler = Scheduler::start(Arc::new(store), runtime, &config.scheduler);

    let addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port).parse()?;
    let state = Arc::new(app::AppState::new(config, scheduler.handle()));
    let router = app::build_router(state);

    info!("Cadence gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.stop().await;
    info!("Cadence gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
