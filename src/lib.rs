pub mod appresult;
pub mod auth;
pub mod config;
pub mod db;
pub mod feed;
pub mod files;
pub mod leads;
pub mod orders;
pub mod orgs;
pub mod reconciler;
pub mod res;
pub mod session;
pub mod storage;
pub mod tracker;
pub mod viewer;
pub mod views;

use std::sync::Arc;

use anyhow::anyhow;
use axum::{extract::FromRef, Router};
use serde_json::Value;
use sqlx::SqlitePool;
use tower_http::trace::TraceLayer;
use tower_sessions::{cookie::SameSite, Expiry, MemoryStore, SessionManagerLayer};

pub use appresult::{AppError, AppResult};

use config::Config;
use feed::ChangeFeed;
use storage::Bucket;
use tracker::Tracker;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub db_pool: SqlitePool,
    pub feed: ChangeFeed,
    pub tracker: Tracker,
    pub bucket: Bucket,
    pub clients: auth::Clients,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(db_pool: SqlitePool, config: Config, clients: auth::Clients) -> Self {
        let feed = ChangeFeed::new(config.feed_capacity);
        Self {
            tracker: Tracker::new(db_pool.clone(), feed.clone()),
            bucket: Bucket::new("media", &config.media_dir, &config.public_url),
            db_pool,
            feed,
            clients,
            config: Arc::new(config),
        }
    }
}

/// The whole HTTP surface with sessions and request tracing.
pub fn app(state: AppState) -> Router {
    with_layers(routes(), state)
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .merge(views::router())
        .merge(orgs::router())
        .merge(orders::router())
        .merge(files::router())
        .merge(leads::router())
        .merge(auth::router())
}

/// Binds the state and wraps `routes` in the session and trace layers.
pub fn with_layers(routes: Router<AppState>, state: AppState) -> Router {
    let session_layer = SessionManagerLayer::new(MemoryStore::default())
        .with_secure(state.config.public_url.starts_with("https://"))
        .with_same_site(SameSite::Lax)
        .with_expiry(Expiry::OnInactivity(time::Duration::minutes(state.config.session_minutes)));

    routes
        .with_state(state)
        .layer(session_layer)
        .layer(TraceLayer::new_for_http())
}

pub trait GetField {
    fn get_str_field(&self, field: &str) -> AppResult<String>;
}

impl GetField for Value {
    fn get_str_field(&self, field: &str) -> AppResult<String> {
        Ok(
            self.get(field)
            .ok_or_else(|| anyhow!("expected {field} in {self}"))?
            .as_str()
            .ok_or_else(|| anyhow!("expected {field} in {self} to be string"))?
            .to_owned()
        )
    }
}
