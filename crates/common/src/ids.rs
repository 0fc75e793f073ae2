//! Request-id generation.
//!
//! Every request that passes through the gateway is tagged with a compact
//! hexadecimal id that travels upstream in `X-Request-Id` and comes back to
//! the client in the response. Sixteen hex characters (64 random bits) keep
//! the id double-click selectable in terminals while making collisions
//! irrelevant at any realistic request rate.

use std::fmt::Write;

/// Length of a request id in characters.
pub const REQUEST_ID_LENGTH: usize = 16;

/// Generate a fresh request id: 8 random bytes, lowercase hex encoded.
///
/// `rand::random` draws from the thread-local CSPRNG, so ids are not
/// guessable across requests.
pub fn request_id() -> String {
    let bytes: [u8; REQUEST_ID_LENGTH / 2] = rand::random();
    let mut out = String::with_capacity(REQUEST_ID_LENGTH);
    for b in bytes {
        // Infallible for String targets.
        let _ = write!(out, "{b:02x}");
    }
    out
}
