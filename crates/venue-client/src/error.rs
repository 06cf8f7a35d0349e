//! Errors returned by the request pipeline

use reqwest::StatusCode;
use venue_session::{LogoutReason, RefreshError};

/// A failed call, flattened to what the UI shows.
///
/// `status` is `None` when no response arrived (unreachable host, timeout).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HttpError {
    pub status: Option<StatusCode>,
    pub message: String,
}

impl HttpError {
    pub fn is_unauthorized(&self) -> bool {
        self.status == Some(StatusCode::UNAUTHORIZED)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Http(#[from] HttpError),

    /// The credential could not be refreshed; the session has ended.
    #[error(transparent)]
    SessionEnded(#[from] RefreshError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("response decode failed: {0}")]
    Decode(String),

    #[error("credential storage error: {0}")]
    Storage(#[from] venue_auth::Error),

    #[error("client setup failed: {0}")]
    Setup(String),
}

impl Error {
    /// HTTP status of the final response, if one arrived.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Http(e) => e.status,
            _ => None,
        }
    }

    /// Why the session ended, when this error ended it.
    pub fn logout_reason(&self) -> Option<LogoutReason> {
        match self {
            Error::SessionEnded(e) => Some(e.reason),
            _ => None,
        }
    }
}

/// Result alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;
