//! Refresh metrics
//!
//! - `session_refresh_total` (counter): label `outcome` (`success` or a logout reason)
//! - `session_refresh_waiters_total` (counter): callers that joined an in-flight refresh
//!
//! All calls are no-ops until the host installs a recorder.

use crate::classify::LogoutReason;

pub fn record_refresh_success() {
    metrics::counter!("session_refresh_total", "outcome" => "success").increment(1);
}

pub fn record_refresh_failure(reason: LogoutReason) {
    metrics::counter!("session_refresh_total", "outcome" => reason.as_str()).increment(1);
}

pub fn record_waiter() {
    metrics::counter!("session_refresh_waiters_total").increment(1);
}
