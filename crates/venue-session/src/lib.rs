//! Session lifecycle for the venue dashboard API client
//!
//! Owns the decision of *when* credentials are refreshed and what happens
//! when that fails. The request pipeline calls
//! `RefreshCoordinator::ensure_fresh_token()` after a 401; the coordinator
//! makes sure only one refresh is in flight, and on failure clears the
//! credential store and publishes a single `SessionEnded` event.
//!
//! Failure path:
//! 1. Refresh endpoint rejects the token (or no refresh token is stored)
//! 2. `classify()` maps the backend code to a `LogoutReason`
//! 3. Credential store is cleared
//! 4. `SessionEvents::publish()` notifies routing/UI subscribers
//! 5. Every waiter receives the same `RefreshError`

pub mod classify;
pub mod coordinator;
pub mod error;
pub mod events;
mod metrics;

pub use classify::{LogoutReason, classify};
pub use coordinator::{ExchangeFuture, RefreshCoordinator, TokenRefresher};
pub use error::{RefreshError, Result};
pub use events::{SessionEnded, SessionEvents};
