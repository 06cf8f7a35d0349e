//! Logout reasons for failed refreshes
//!
//! The refresh endpoint reports why it refused a refresh token with an error
//! code in its body. The UI needs a closed set of reasons to pick the login
//! screen's banner, so every code maps onto one of six variants.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogoutReason {
    /// Session was revoked or no longer exists server-side
    SessionInvalidated,
    /// Session timed out from inactivity
    SessionInactive,
    /// Refresh token expired or was rejected
    SessionExpired,
    /// Backend suspects the session was hijacked
    SessionSecurity,
    /// No refresh token stored locally; refresh never attempted
    MissingRefreshToken,
    /// Anything else, including transport failures
    TokenRefreshFailed,
}

impl LogoutReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogoutReason::SessionInvalidated => "session_invalidated",
            LogoutReason::SessionInactive => "session_inactive",
            LogoutReason::SessionExpired => "session_expired",
            LogoutReason::SessionSecurity => "session_security",
            LogoutReason::MissingRefreshToken => "missing_refresh_token",
            LogoutReason::TokenRefreshFailed => "token_refresh_failed",
        }
    }
}

impl fmt::Display for LogoutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a refresh endpoint error code to a logout reason.
///
/// Matching is case-insensitive and ignores surrounding whitespace. Never
/// returns `MissingRefreshToken`; the coordinator assigns that one itself.
pub fn classify(backend_code: Option<&str>) -> LogoutReason {
    let Some(code) = backend_code else {
        return LogoutReason::TokenRefreshFailed;
    };
    match code.trim().to_ascii_uppercase().as_str() {
        "SESSION_EXPIRED_INACTIVE" => LogoutReason::SessionInactive,
        "SESSION_HIJACK_DETECTED" => LogoutReason::SessionSecurity,
        "INVALID_SESSION" | "SESSION_REVOKED" => LogoutReason::SessionInvalidated,
        "INVALID_REFRESH_TOKEN" => LogoutReason::SessionExpired,
        _ => LogoutReason::TokenRefreshFailed,
    }
}
