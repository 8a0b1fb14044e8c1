// ============================================================================
// Logging Configuration
// ============================================================================

use crate::env::parse_or;

#[derive(Clone, Debug, Default)]
pub struct LoggingConfig {
    /// Log sender/recipient identifiers in clear text (off in production)
    pub enable_user_identifiers: bool,
    /// Salt for hashed identifiers in logs
    pub hash_salt: String,
}

impl LoggingConfig {
    pub(crate) fn from_env() -> anyhow::Result<Self> {
        let hash_salt = std::env::var("LOG_HASH_SALT").unwrap_or_default();
        if hash_salt.is_empty() {
            tracing::warn!("LOG_HASH_SALT is not set - hashed identifiers in logs are unsalted");
        }
        Ok(Self {
            enable_user_identifiers: parse_or("LOG_USER_IDENTIFIERS", false),
            hash_salt,
        })
    }
}
