//! Credential storage and token refresh for the venue dashboard API
//!
//! This crate owns the tokens and the single network call that rotates
//! them. It has no opinion on *when* to refresh; that is the coordinator's
//! job in `venue-session`.
//!
//! Credential flow:
//! 1. Login stores a pair via `CredentialStore::login()` in the tier picked
//!    by the "remember me" flag
//! 2. The request pipeline reads `CredentialStore::access_token()` per call
//! 3. On expiry the coordinator calls `RefreshEndpoint::refresh()` and writes
//!    the result back with `CredentialStore::set()`
//! 4. Logout or an unrecoverable refresh calls `CredentialStore::clear()`

pub mod constants;
pub mod credentials;
pub mod envelope;
pub mod error;
pub mod token;

pub use constants::*;
pub use credentials::{
    CredentialPair, CredentialStore, Entry, FileNamespace, MemoryNamespace, Namespace,
    Persistence,
};
pub use error::{Error, Result};
pub use token::{RefreshEndpoint, TokenResponse, refresh_token};
