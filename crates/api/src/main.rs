//! Herald API server binary entrypoint.

use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use herald_common::config::AppConfig;
use herald_common::db::connect_database;
use herald_common::redis_pool::connect_redis;
use herald_engine::dispatcher::Dispatcher;
use herald_engine::ledger::PgDeliveryLedger;
use herald_engine::queue::RedisJobQueue;
use herald_engine::templates::TemplateService;

use herald_api::routes::create_router;
use herald_api::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("herald_api=debug,herald_engine=debug,tower_http=debug")
        }))
        .init();

    tracing::info!("Starting Herald API server...");

    let config = AppConfig::from_env()?;
    let policy = config.retry_policy()?;

    let pool = connect_database(&config).await?;

    if config.seed_templates {
        TemplateService::seed_defaults(&pool).await?;
    }

    let redis = connect_redis(&config).await?;

    let dispatcher = Dispatcher::new(
        Arc::new(PgDeliveryLedger::new(pool.clone())),
        Arc::new(RedisJobQueue::new(
            redis,
            &config.queue_name,
            config.queue_lease_seconds,
        )),
        policy,
    );

    let port = config.api_port;
    let state = AppState::new(pool, Arc::new(dispatcher), config);

    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    tracing::info!("Herald API server stopped.");
    Ok(())
}
