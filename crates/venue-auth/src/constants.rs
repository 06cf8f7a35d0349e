//! Backend endpoint and storage-layout constants
//!
//! The storage keys match the layout the dashboard front end already writes,
//! so sessions survive a switch between clients.

/// Path of the token refresh endpoint, relative to the API base URL.
pub const REFRESH_PATH: &str = "/auth/refresh-token";

/// Storage key holding the access token.
pub const ACCESS_TOKEN_KEY: &str = "authToken";

/// Storage key holding the refresh token.
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";

/// Message used when neither the backend nor the transport said anything useful.
pub const GENERIC_ERROR_MESSAGE: &str = "Request failed";
