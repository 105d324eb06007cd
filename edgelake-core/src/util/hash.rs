use sha2::{Digest, Sha256};

pub fn sha256(token: &str) -> String {
    sha256_bytes(token.as_bytes())
}

pub fn sha256_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Digest of `parts` joined with `/`, used for content keys.
pub fn sha256_joined(parts: &[&str]) -> String {
    sha256(&parts.join("/"))
}
