//! Deterministic relation identity.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Content hash identifying a candidate relation: entity types plus the
/// property mapping between them.
///
/// Logically identical mappings hash identically regardless of discovery
/// order — the map is sorted before hashing — which is what makes
/// heuristic accumulation commutative across passes.
pub fn derive_relation_id(
    entity_a_type: &str,
    entity_b_type: &str,
    mapping: &BTreeMap<String, String>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(entity_a_type.as_bytes());
    hasher.update([0x1e]);
    hasher.update(entity_b_type.as_bytes());
    for (a_prop, b_prop) in mapping {
        hasher.update([0x1f]);
        hasher.update(a_prop.as_bytes());
        hasher.update([0x1e]);
        hasher.update(b_prop.as_bytes());
    }
    let digest = hasher.finalize();
    hex(&digest[..16])
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}
