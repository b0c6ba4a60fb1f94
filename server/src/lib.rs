pub mod auth;
pub mod chat;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod health;
pub mod llm;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod notifier;
pub mod realtime;

use std::sync::Arc;

use axum::extract::FromRef;

use auth::JwtVerifier;
use config::Config;
use db::DbPool;
use notifier::Notifier;

/// Shared application state handed to every handler via axum's `State`
/// extractor. Cheap to clone: everything behind an `Arc` or a pool handle.
#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub notifier: Arc<dyn Notifier>,
    pub jwt: Arc<JwtVerifier>,
    pub config: Arc<Config>,
}

impl FromRef<AppState> for DbPool {
    fn from_ref(state: &AppState) -> Self {
        state.db.clone()
    }
}
