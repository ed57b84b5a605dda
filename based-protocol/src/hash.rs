//! Observable and channel identity.

use crate::ObsId;
use serde_json::Value;
use xxhash_rust::xxh3::xxh3_64;

/// Returns the canonical form of a JSON payload.
///
/// Object keys are sorted and whitespace is dropped. An empty payload stays
/// empty and text that does not parse as JSON is returned verbatim.
pub fn canonical_payload(payload: &str) -> String {
    if payload.is_empty() {
        return String::new();
    }
    match serde_json::from_str::<Value>(payload) {
        // Value maps are BTreeMaps, so serialization is key-ordered.
        Ok(value) => serde_json::to_string(&value).unwrap_or_else(|_| payload.to_string()),
        Err(_) => payload.to_string(),
    }
}

/// Computes the id of the observable or channel for `(name, payload)`.
pub fn obs_id(name: &str, payload: &str) -> ObsId {
    let payload_hash = xxh3_64(canonical_payload(payload).as_bytes());
    let name_hash = xxh3_64(name.as_bytes());
    payload_hash.wrapping_mul(33) ^ name_hash
}
