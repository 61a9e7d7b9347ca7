mod app;
mod cache;
mod errors;
mod external;
mod logging;
mod models;
mod registry;
mod routes;
mod runner;
mod services;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;

use crate::cache::{CacheClient, CacheConfig};
use crate::external::offline::{MemoryReportSink, OfflineMarketData, OfflineSentiment};
use crate::registry::memory::MemoryJobStore;
use crate::registry::pg::PgJobStore;
use crate::registry::store::JobStore;
use crate::registry::{JobRegistry, RegistryConfig};
use crate::runner::ReportRunner;
use crate::services::report_scheduler::ReportSchedulerService;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Initialize logging FIRST
    logging::init_logging(logging::LoggingConfig::from_env())?;

    let store: Arc<dyn JobStore> = match std::env::var("DATABASE_URL") {
        Ok(database_url) => {
            tracing::info!("🗄️ Using Postgres job store");
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(&database_url)
                .await?;
            Arc::new(PgJobStore::new(pool))
        }
        Err(_) => {
            tracing::info!("🗄️ DATABASE_URL not set, using in-memory job store");
            Arc::new(MemoryJobStore::new())
        }
    };

    let cache = CacheClient::new(CacheConfig::from_env());
    let registry = Arc::new(JobRegistry::new(store, RegistryConfig::from_env()));

    // Provider wiring; only offline fixtures ship here, live vendor
    // integrations plug in behind the same traits
    let provider_mode = std::env::var("REPORT_PROVIDERS").unwrap_or_else(|_| "offline".to_string());
    let runner = match provider_mode.as_str() {
        "offline" => {
            tracing::info!("📊 Using offline fixture providers");
            Arc::new(ReportRunner::new(
                registry.clone(),
                cache.clone(),
                Arc::new(OfflineMarketData::new()),
                Arc::new(OfflineSentiment::new()),
                Arc::new(MemoryReportSink::new()),
            ))
        }
        other => {
            panic!("Invalid REPORT_PROVIDERS: {}. Must be 'offline'", other);
        }
    };

    let scheduler_enabled = std::env::var("REPORT_SCHEDULER_ENABLED")
        .unwrap_or_else(|_| "true".to_string())
        .parse::<bool>()
        .unwrap_or(true);

    let mut _scheduler = None;
    if scheduler_enabled {
        let mut service = ReportSchedulerService::new(runner.clone()).await?;
        service.start().await?;
        _scheduler = Some(service);
    } else {
        tracing::info!("⏸️ Report scheduler disabled");
    }

    let state = AppState {
        registry,
        cache,
        runner,
    };
    let app = app::create_app(state);

    let port = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(3000);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("🚀 Marketbrief backend running at http://{}/", addr);
    axum::serve(listener, app).await?;

    Ok(())
}
