//! Source entity fingerprint
//!
//! `entities_hash` is a SHA-256 digest over the active source entities a
//! collection graph was built from. Recomputing it and comparing against the
//! stored value is how drift is detected.

use chrono::SecondsFormat;
use sha2::{Digest, Sha256};

use crate::graph::GraphEntity;

/// One line per entity, independent of input order
fn identity_line(entity: &GraphEntity) -> String {
    format!(
        "{}\t{}\t{}\t{}",
        entity.uuid.simple(),
        entity.entity_type,
        entity.name,
        entity.updated_at.to_rfc3339_opts(SecondsFormat::Micros, true)
    )
}

/// Compute the fingerprint of a set of source entities
///
/// Inactive entities are ignored. The empty set has a well-defined hash.
pub fn entities_hash<'a, I>(entities: I) -> String
where
    I: IntoIterator<Item = &'a GraphEntity>,
{
    let mut lines: Vec<String> = entities
        .into_iter()
        .filter(|e| e.is_active)
        .map(identity_line)
        .collect();
    lines.sort();

    let mut hasher = Sha256::new();
    for line in &lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}
