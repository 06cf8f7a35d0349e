//! Error types for credential storage and token refresh

/// Errors from credential storage and the refresh endpoint.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transport failure or timeout talking to the refresh endpoint.
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// The refresh endpoint answered with a non-2xx status.
    ///
    /// `code` is the flattened backend error (`error`, then `message`) and
    /// drives logout classification.
    #[error("refresh rejected ({status}): {message}")]
    Rejected {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("invalid token response: {0}")]
    TokenParse(String),

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    /// Backend error code carried by a rejected refresh, if any.
    pub fn backend_code(&self) -> Option<&str> {
        match self {
            Error::Rejected { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
