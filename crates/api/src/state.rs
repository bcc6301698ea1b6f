//! Shared application state for the Axum API server.

use std::sync::Arc;

use herald_common::config::AppConfig;
use herald_engine::dispatcher::Dispatcher;
use sqlx::PgPool;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub dispatcher: Arc<Dispatcher>,
    pub config: AppConfig,
}

impl AppState {
    pub fn new(pool: PgPool, dispatcher: Arc<Dispatcher>, config: AppConfig) -> Self {
        Self {
            pool,
            dispatcher,
            config,
        }
    }
}
