//! Refresh endpoint client
//!
//! `POST {base_url}/auth/refresh-token` with `{"refresh_token": "..."}`. A
//! successful response is `{"token": "...", "refresh_token": "..."}` where the
//! rotated refresh token is optional. Error bodies are flattened through
//! [`crate::envelope`] so the coordinator can classify them.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::REFRESH_PATH;
use crate::envelope;
use crate::error::{Error, Result};

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// Response from the refresh endpoint.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    /// New access token
    pub token: String,
    /// Rotated refresh token; absent when the backend keeps the old one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

/// Exchange a refresh token for a new access token.
///
/// The call is bounded by `timeout` like any other dispatch; a timeout comes
/// back as [`Error::Http`].
pub async fn refresh_token(
    client: &reqwest::Client,
    url: &str,
    refresh: &str,
    timeout: Duration,
) -> Result<TokenResponse> {
    let response = client
        .post(url)
        .timeout(timeout)
        .json(&RefreshRequest {
            refresh_token: refresh,
        })
        .send()
        .await
        .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.bytes().await.unwrap_or_default();
        let code = envelope::backend_message(&body);
        let message = envelope::flatten_message(&body, Some(&status.to_string()));
        debug!(status = status.as_u16(), code = ?code, "refresh endpoint rejected token");
        return Err(Error::Rejected {
            status: status.as_u16(),
            code,
            message,
        });
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::TokenParse(format!("invalid refresh response: {e}")))
}

/// The refresh endpoint of one backend, bound to a shared HTTP client.
#[derive(Debug, Clone)]
pub struct RefreshEndpoint {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl RefreshEndpoint {
    pub fn new(client: reqwest::Client, base_url: &str, timeout: Duration) -> Self {
        Self {
            client,
            url: format!("{}{}", base_url.trim_end_matches('/'), REFRESH_PATH),
            timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn refresh(&self, refresh: &str) -> Result<TokenResponse> {
        refresh_token(&self.client, &self.url, refresh, self.timeout).await
    }
}
