use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use serde_json::json;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

/// Failures the caller can act on. Anything else surfaces as a 500.
#[derive(Debug, thiserror::Error)]
pub enum PortalError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("sign in required")]
    Unauthorized,
    #[error("not allowed: {0}")]
    Forbidden(&'static str),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Conflict(String),
}

impl PortalError {
    fn status(&self) -> StatusCode {
        use PortalError::*;
        match self {
            NotFound(_) => StatusCode::NOT_FOUND,
            Unauthorized => StatusCode::UNAUTHORIZED,
            Forbidden(_) => StatusCode::FORBIDDEN,
            Validation(_) => StatusCode::BAD_REQUEST,
            Conflict(_) => StatusCode::CONFLICT,
        }
    }
}

impl IntoResponse for PortalError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self.0.downcast::<PortalError>() {
            Ok(err) => err.into_response(),
            Err(err) => {
                tracing::error!("{err}\n\n{}", err.backtrace());
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": err.to_string() })),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl AppError {
    /// The domain error carried inside, if any.
    pub fn portal(&self) -> Option<&PortalError> {
        self.0.downcast_ref()
    }
}
