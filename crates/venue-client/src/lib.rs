//! Authenticated HTTP client for the venue dashboard API
//!
//! `ApiClient` is the only thing the rest of the dashboard talks to. It
//! attaches the stored bearer token, and on an expired credential refreshes it
//! once through the shared `RefreshCoordinator` before retrying the call.
//!
//! ```text
//! execute(spec)
//!   -> dispatch with Bearer <access_token>
//!   -> 401? (not the refresh endpoint, first attempt)
//!        -> coordinator.ensure_fresh_token()
//!        -> dispatch once more
//!   -> ApiResponse | Error::Http | Error::SessionEnded
//! ```
//!
//! When the refresh fails the coordinator clears the credentials and publishes
//! `SessionEnded`; subscribe with [`ApiClient::subscribe`].

pub mod config;
pub mod error;
mod metrics;
pub mod pipeline;

pub use config::{ApiConfig, ClientConfig, HeaderInjection, StorageConfig};
pub use error::{Error, HttpError, Result};
pub use pipeline::{ApiClient, ApiResponse, RequestSpec, build_http_client, is_refresh_endpoint};
