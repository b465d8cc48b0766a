use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::warn;

/// Failures of an admission request, returned to the API server as HTTP errors.
#[derive(Error, Debug)]
pub enum WebhookError {
    /// The request or the rules it depends on are ill-formed.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// A lookup the decision depends on failed.
    #[error("lookup failed: {0}")]
    Remote(String),
}

impl WebhookError {
    pub fn status(&self) -> StatusCode {
        match self {
            WebhookError::BadRequest(_) => StatusCode::BAD_REQUEST,
            WebhookError::Remote(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<kube::Error> for WebhookError {
    fn from(e: kube::Error) -> Self {
        WebhookError::Remote(e.to_string())
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        warn!("admission failed: {}", self);
        (self.status(), self.to_string()).into_response()
    }
}
