use sha2::{Digest, Sha256};

/// Truncated, salted hash of an identifier for log lines.
///
/// Recipients and sender ids are personal data; logs carry this instead
/// unless `LOG_USER_IDENTIFIERS` is enabled.
pub fn log_safe_id(id: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(id.as_bytes());
    let hash = hasher.finalize();

    hex::encode(&hash[..4])
}
