//! Shared building blocks for the venue dashboard client crates

mod error;
mod secret;
pub mod telemetry;

pub use error::{Error, Result};
pub use secret::Secret;
