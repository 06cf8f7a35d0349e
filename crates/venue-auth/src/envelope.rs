//! Backend error envelope flattening
//!
//! Backend failures arrive as `{"error": "...", "message": "..."}` with either
//! field optional. Callers see a single message: `error`, then `message`, then
//! whatever the transport reported, then a generic fallback.

use serde_json::Value;

use crate::constants::GENERIC_ERROR_MESSAGE;

/// Extract the backend's own message from an error body, if it has one.
///
/// Non-JSON bodies, non-string fields and blank strings are treated as absent.
pub fn backend_message(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    ["error", "message"].iter().find_map(|field| {
        value
            .get(field)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
    })
}

/// Flatten an error body into the message surfaced to callers.
pub fn flatten_message(body: &[u8], transport: Option<&str>) -> String {
    backend_message(body)
        .or_else(|| {
            transport
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
        })
        .unwrap_or_else(|| GENERIC_ERROR_MESSAGE.to_owned())
}
