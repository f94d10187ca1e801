//! View controllers: the dashboard, per-organization chat and media library,
//! and the live socket that keeps open pages current.

pub mod dashboard;
pub mod live;
pub mod media;
pub mod messages;

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get},
    Router,
};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(dashboard::index))
        .route("/unread", get(dashboard::unread))
        .route("/o/{org}/messages", get(messages::list).post(messages::send))
        .route(
            "/o/{org}/media",
            get(media::list)
                .post(media::create)
                .layer(DefaultBodyLimit::max(media::MAX_UPLOAD_BYTES)),
        )
        .route("/o/{org}/media/{id}", delete(media::remove))
        .route("/media/{*path}", get(media::download))
        .route("/live", get(live::live))
}
