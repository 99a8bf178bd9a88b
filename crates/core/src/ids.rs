//! Correlation-id minting.
//!
//! A trace id is minted once at ingress and copied into every downstream
//! message and log line; a group id scopes a set of related uploads (one
//! batch job, one multi-image message).

use uuid::Uuid;

/// Mint a fresh trace id (uuid-v4, 36 chars).
pub fn new_trace_id() -> String {
    Uuid::new_v4().to_string()
}

/// Mint a fresh group id (uuid-v4, 36 chars).
pub fn new_group_id() -> String {
    Uuid::new_v4().to_string()
}

/// First 8 characters of an id, for compact filenames and log prefixes.
pub fn short(id: &str) -> &str {
    let end = id
        .char_indices()
        .nth(8)
        .map(|(i, _)| i)
        .unwrap_or(id.len());
    &id[..end]
}
