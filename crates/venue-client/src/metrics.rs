//! Pipeline metrics
//!
//! - `client_requests_total` (counter): labels `method`, `status`
//! - `client_unauthorized_retries_total` (counter): 401s answered with a retry

/// Record a completed dispatch. `status` is `"error"` when no response arrived.
pub fn record_request(method: &str, status: &str) {
    metrics::counter!("client_requests_total", "method" => method.to_string(), "status" => status.to_string())
        .increment(1);
}

pub fn record_unauthorized_retry() {
    metrics::counter!("client_unauthorized_retries_total").increment(1);
}
