use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use flow_lite_core::engine::FlowEngine;
use flow_lite_core::eval::RhaiEvaluator;
use flow_lite_core::store::FlowStore;
use flow_lite_core::store_memory::MemoryStore;
use flow_lite_core::timer::{TimerScheduler, DEFAULT_TIMER_INTERVAL};
use flow_lite_server::http::{self, AppState};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let addr: SocketAddr = arg_or_env("--listen", "LISTEN_ADDR")
        .unwrap_or_else(|| "0.0.0.0:6062".to_string())
        .parse()?;
    let database_url = arg_or_env("--database-url", "DATABASE_URL");

    let store: Arc<dyn FlowStore> = match database_url {
        #[cfg(feature = "postgres")]
        Some(url) => {
            tracing::info!("Connecting to PostgreSQL...");
            let pool = sqlx::PgPool::connect(&url).await?;
            let pg = flow_lite_core::store_postgres::PostgresFlowStore::new(pool);
            pg.migrate().await?;
            tracing::info!("Using PostgresFlowStore (migrations applied)");
            Arc::new(pg)
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => {
            tracing::warn!(
                "--database-url / DATABASE_URL set but postgres feature not enabled, using MemoryStore"
            );
            Arc::new(MemoryStore::new())
        }
        None => {
            tracing::info!("Using MemoryStore (no database URL configured)");
            Arc::new(MemoryStore::new())
        }
    };

    let engine = Arc::new(FlowEngine::new(store, Arc::new(RhaiEvaluator::new())));
    let restored = engine.restore().await?;
    if restored > 0 {
        tracing::info!(restored, "republished persisted flow definitions");
    }

    let interval = arg_or_env("--timer-interval-secs", "TIMER_INTERVAL_SECS")
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_TIMER_INTERVAL);
    let _scheduler = TimerScheduler::spawn(engine.clone(), interval);

    let app = http::router(AppState { engine });
    tracing::info!("flow-lite server listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Read a setting from `--flag <value>` CLI args, falling back to an
/// environment variable.
fn arg_or_env(flag: &str, env: &str) -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    if let Some(value) = args.windows(2).find(|w| w[0] == flag).map(|w| w[1].clone()) {
        return Some(value);
    }
    std::env::var(env).ok()
}
