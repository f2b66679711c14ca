//! Admission middleware that gates requests behind the leaky bucket.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{debug, info};

use crate::error::SluiceError;
use crate::ratelimit::AdmissionControl;

/// Header carrying the identifier of an admission request.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Reserve a slot before running the rest of the stack.
///
/// Rejected requests get a `429 Too Many Requests` and never reach the
/// downstream handler. Admitted requests run the handler inline and return its
/// response unchanged.
pub async fn admit(
    State(limiter): State<Arc<dyn AdmissionControl>>,
    request: Request,
    next: Next,
) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_owned();

    if !limiter.try_admit() {
        info!(
            request_id = %request_id,
            method = %request.method(),
            path = %request.uri().path(),
            "Rate limit exceeded, rejecting request"
        );
        return SluiceError::RateLimited {
            retry_after: limiter.retry_after(),
        }
        .into_response();
    }

    debug!(request_id = %request_id, path = %request.uri().path(), "Request admitted");
    next.run(request).await
}
