use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::fmt::Display;
use thiserror::Error;

use crate::admission::AdmissionError;
use crate::auth::{AuthorizationError, ValidationError};
use crate::pipeline::DedupError;

/// Error returned across the HTTP boundary
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Request carries no caller identity")]
    Unauthenticated,

    #[error(transparent)]
    Authorization(#[from] AuthorizationError),

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error("Invalid input: {0}")]
    Validation(#[from] ValidationError),

    #[error("Upstream failure: {0}")]
    Upstream(String),

    #[error("Internal error")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthenticated => StatusCode::UNAUTHORIZED,
            AppError::Authorization(AuthorizationError::StoreUnavailable(_)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::Authorization(_) => StatusCode::FORBIDDEN,
            AppError::Admission(AdmissionError::QueueFull { .. }) => StatusCode::TOO_MANY_REQUESTS,
            AppError::Admission(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code carried in the response body
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Unauthenticated => "UNAUTHENTICATED",
            AppError::Authorization(err) => err.code(),
            AppError::Admission(err) => err.code(),
            AppError::Validation(_) => "INVALID_INPUT",
            AppError::Upstream(_) => "UPSTREAM_FAILURE",
            AppError::Internal(_) => "INTERNAL",
        }
    }

    fn public_message(&self) -> String {
        match self {
            // Store details stay in the logs
            AppError::Authorization(AuthorizationError::StoreUnavailable(_)) => {
                "authorization is temporarily unavailable".to_string()
            }
            AppError::Internal(_) => "Internal error".to_string(),
            _ => self.to_string(),
        }
    }
}

impl<E: Display> From<DedupError<E>> for AppError {
    fn from(err: DedupError<E>) -> Self {
        match err {
            DedupError::Upstream(e) => AppError::Upstream(e.to_string()),
            DedupError::Aborted => AppError::Upstream("in-flight request was aborted".to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = ?self, code = self.code(), "Request failed");
        } else {
            tracing::debug!(error = %self, code = self.code(), "Request rejected");
        }

        let body = json!({
            "error": {
                "code": self.code(),
                "message": self.public_message(),
            }
        });

        (status, Json(body)).into_response()
    }
}
