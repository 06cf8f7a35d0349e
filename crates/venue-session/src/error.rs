//! Error returned to every caller waiting on a failed refresh

use crate::classify::LogoutReason;

/// A refresh failed and the session is over.
///
/// Cloned to every waiter of the failed refresh, so all of them see the same
/// reason and backend code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("session ended: {reason}")]
pub struct RefreshError {
    pub reason: LogoutReason,
    /// Error code or message reported by the refresh endpoint
    pub backend_error: Option<String>,
}

impl RefreshError {
    pub fn new(reason: LogoutReason, backend_error: Option<String>) -> Self {
        Self {
            reason,
            backend_error,
        }
    }
}

/// Result alias for coordinator operations.
pub type Result<T> = std::result::Result<T, RefreshError>;
