//! Content digest helpers for the protocol surfaces, where hashes are
//! always `sha256:` followed by 64 lowercase hex digits.

use sha2::{Digest, Sha256};

/// Computes the `sha256:<hex>` digest of a byte slice.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Whether a reference string is a well-formed sha256 content digest.
pub fn is_digest(reference: &str) -> bool {
    match reference.strip_prefix("sha256:") {
        Some(rest) => {
            rest.len() == 64
                && rest
                    .bytes()
                    .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        }
        None => false,
    }
}
