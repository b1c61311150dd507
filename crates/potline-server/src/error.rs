//! Server error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use potline::{CoordinatorError, ErrorCategory};
use thiserror::Error;

use crate::config::ConfigError;

/// Startup and serving failures.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Storage setup failed: {0}")]
    Storage(#[source] anyhow::Error),

    #[error("Hardware client setup failed: {0}")]
    Hardware(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A coordinator error on its way to an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub CoordinatorError);

impl From<CoordinatorError> for ApiError {
    fn from(err: CoordinatorError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self.0.category() {
            ErrorCategory::NotFound => StatusCode::NOT_FOUND,
            ErrorCategory::Rejected => StatusCode::BAD_REQUEST,
            ErrorCategory::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // storage details stay in the logs
        let message = match &self.0 {
            CoordinatorError::Storage(err) => {
                tracing::error!(error = %err, "Storage failure while handling request");
                "Internal server error".to_owned()
            }
            other => other.to_string(),
        };

        let body = serde_json::json!({
            "message": message,
            "error": self.0.kind(),
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn status_codes_follow_category() {
        let id = Uuid::new_v4();
        assert_eq!(
            ApiError(CoordinatorError::NotFound(id)).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError(CoordinatorError::AlreadyActive(id)).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError(CoordinatorError::InvalidInput("x".into())).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError(CoordinatorError::Storage(anyhow::anyhow!("boom"))).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
