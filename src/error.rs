//! Error types for the Sluice service.

use std::time::Duration;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Main error type for Sluice operations.
#[derive(Error, Debug)]
pub enum SluiceError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The admission gate has no free slot
    #[error("Rate limit exceeded")]
    RateLimited {
        /// Upper bound on the wait until a slot is released
        retry_after: Duration,
    },

    /// Upstream request errors
    #[error("Upstream error: {0}")]
    Upstream(#[from] reqwest::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for SluiceError {
    fn from(err: config::ConfigError) -> Self {
        SluiceError::Config(err.to_string())
    }
}

impl IntoResponse for SluiceError {
    fn into_response(self) -> Response {
        match self {
            SluiceError::RateLimited { retry_after } => {
                let mut response =
                    (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded").into_response();
                // Round up so clients never retry before the next drain tick.
                let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(secs.max(1)));
                response
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response(),
        }
    }
}

/// Result type alias for Sluice operations.
pub type Result<T> = std::result::Result<T, SluiceError>;
