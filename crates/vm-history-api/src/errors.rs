//! Error types for the HTTP service

use axum::{
    extract::rejection::QueryRejection,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use vm_history_core::EventStoreError;
use tracing::{error, warn};

/// History API errors with HTTP status code mapping
///
/// - `400 Bad Request`: malformed or out-of-range query values
/// - `404 Not Found`: unknown event
/// - `503 Service Unavailable`: the event store cannot be reached
/// - `500 Internal Server Error`: anything unexpected
///
/// Bodies are JSON `{error, status, timestamp}`. Internal details are logged
/// server-side and replaced with a generic message.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid query: {message}")]
    InvalidQuery { message: String },

    #[error("Not found: {resource}")]
    NotFound { resource: String },

    #[error("History store unavailable: {message}")]
    StoreUnavailable { message: String },

    #[error("Internal server error: {message}")]
    Internal { message: String },
}

impl ApiError {
    pub fn invalid_query(message: impl Into<String>) -> Self {
        Self::InvalidQuery {
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidQuery { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::StoreUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<EventStoreError> for ApiError {
    fn from(error: EventStoreError) -> Self {
        match error {
            EventStoreError::NotFound { event_id } => Self::NotFound {
                resource: format!("event {}", event_id),
            },
            EventStoreError::Unavailable { message } => Self::StoreUnavailable { message },
            other => Self::Internal {
                message: other.to_string(),
            },
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::InvalidQuery {
            message: rejection.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let (message, retry_after) = match &self {
            Self::InvalidQuery { .. } | Self::NotFound { .. } => (self.to_string(), None),
            Self::StoreUnavailable { message } => {
                warn!(error = %message, "History store unavailable");
                (
                    "History store temporarily unavailable".to_string(),
                    Some(30),
                )
            }
            Self::Internal { message } => {
                error!(error = %message, "Internal server error occurred");
                (
                    "Internal server error occurred. Please try again later.".to_string(),
                    None,
                )
            }
        };

        let body = serde_json::json!({
            "error": message,
            "status": status.as_u16(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        let mut response = (status, Json(body)).into_response();

        if let Some(retry_seconds) = retry_after {
            if let Ok(header_value) = retry_seconds.to_string().parse() {
                response.headers_mut().insert("Retry-After", header_value);
            }
        }

        response
    }
}

/// Service-level errors
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Failed to bind to address {address}: {message}")]
    BindFailed { address: String, message: String },

    #[error("Server failed: {message}")]
    ServerFailed { message: String },

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Storage initialization failed: {0}")]
    Storage(#[from] EventStoreError),
}

impl ServiceError {
    /// Process exit code for the service binary
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::BindFailed { .. } => 1,
            Self::ServerFailed { .. } => 2,
            Self::Configuration(_) => 3,
            Self::Storage(_) => 4,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration loading failed: {0}")]
    Load(#[from] config::ConfigError),
}

#[cfg(test)]
#[path = "errors_tests.rs"]
mod tests;
