//! Deterministic content fingerprinting for target snapshots.
//!
//! The digest serves change/no-change and oscillation detection only; it is
//! not a security boundary. Raw file bytes are folded in sorted path order
//! with a length-framed header per file so distinct snapshots cannot collide
//! by shifting bytes between path and content.

use crate::target::Snapshot;
use sha2::{Digest, Sha256};
use std::fmt;

/// Opaque fixed-length digest of target content.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form for logs; the full digest stays comparable via Eq.
        write!(f, "{}", &self.0[..12.min(self.0.len())])
    }
}

/// Digest a snapshot. Equal content always yields an equal fingerprint.
pub fn fingerprint(snapshot: &Snapshot) -> Fingerprint {
    let mut hasher = Sha256::new();
    for (path, content) in snapshot.files() {
        hasher.update((path.len() as u64).to_le_bytes());
        hasher.update(path.as_bytes());
        hasher.update((content.len() as u64).to_le_bytes());
        hasher.update(content);
    }
    Fingerprint(format!("{:x}", hasher.finalize()))
}
