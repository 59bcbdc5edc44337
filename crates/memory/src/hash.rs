use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 digest, used for document, chunk and cache keys.
pub fn sha256_hex(data: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_ref());
    format!("{:x}", hasher.finalize())
}
