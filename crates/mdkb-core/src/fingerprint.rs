//! Content fingerprints for change detection.
//!
//! A fingerprint is the lowercase hex SHA-256 of a file's raw bytes. It is
//! only ever compared for equality; it plays no part in ranking.

use sha2::{Digest, Sha256};

/// Length of a fingerprint in hex characters
pub const FINGERPRINT_LEN: usize = 64;

/// Compute the fingerprint of a byte buffer
pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
