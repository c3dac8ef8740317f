//! Deterministic document request keys.
//!
//! The key names every artifact of a run: the working subdirectory, the
//! intermediate HTML and the published `{key}.html`. It is a pure function
//! of the strategy and the ordered, deduplicated resource triples:
//!
//! ```text
//! key = sha256(canonical_json(strategy, [(lang, type, book), ...]))[..16]
//! ```
//!
//! Canonicalization collapses whitespace runs, trims, and applies Unicode
//! NFC to every string. Order is never sorted away: permuting the requests
//! yields a different key.

use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

use crate::types::{AssemblyStrategy, DocumentRequest, ResourceRequest};

/// Number of hex characters kept from the digest.
pub const KEY_LENGTH: usize = 16;

/// Compute the key for a document request.
pub fn document_request_key(request: &DocumentRequest) -> String {
    key_for(request.assembly_strategy_kind, &request.unique_requests())
}

/// Compute the key from a strategy and an already-deduplicated request list.
pub fn key_for(strategy: AssemblyStrategy, requests: &[ResourceRequest]) -> String {
    let triples: Vec<[String; 3]> = requests
        .iter()
        .map(|r| {
            [
                canonical_text(&r.lang_code),
                canonical_text(&r.resource_type),
                canonical_text(&r.resource_code),
            ]
        })
        .collect();
    let canonical = serde_json::json!({
        "assembly_strategy_kind": strategy.as_str(),
        "resource_requests": triples,
    });
    let digest = Sha256::digest(canonical.to_string().as_bytes());
    let hex = format!("{:x}", digest);
    hex[..KEY_LENGTH].to_string()
}

/// NFC-normalize and collapse internal whitespace runs to single spaces.
fn canonical_text(s: &str) -> String {
    let normalized: String = s.nfc().collect();
    normalized.split_whitespace().collect::<Vec<_>>().join(" ")
}
