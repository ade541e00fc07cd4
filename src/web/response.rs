//! Responses produced by the throttle middleware itself.

use axum::body::Body;
use http::header::{CONTENT_TYPE, RETRY_AFTER};
use http::{HeaderValue, Response, StatusCode};

/// Body of every throttled response.
pub const BLOCKED_BODY: &str = "Retry later\n";

/// Body returned when throttling could not be evaluated.
pub const UNAVAILABLE_BODY: &str = "Service unavailable\n";

/// The response sent to a throttled client: `429`, `Retry-After` in whole
/// seconds, and a fixed plain-text body.
pub fn blocked_response(retry_after: u64) -> Response<Body> {
    plain_text(StatusCode::TOO_MANY_REQUESTS, BLOCKED_BODY, Some(retry_after))
}

/// The response sent when evaluation failed under a rejecting failure policy.
pub fn unavailable_response() -> Response<Body> {
    plain_text(StatusCode::SERVICE_UNAVAILABLE, UNAVAILABLE_BODY, None)
}

fn plain_text(status: StatusCode, body: &'static str, retry_after: Option<u64>) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    if let Some(secs) = retry_after {
        headers.insert(RETRY_AFTER, HeaderValue::from(secs));
    }
    response
}
