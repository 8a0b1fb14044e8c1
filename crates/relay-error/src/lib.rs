use thiserror::Error;

pub type RelayResult<T> = Result<T, RelayError>;

// ============================================================================
// ErrorKind - failure taxonomy driving retry / reconnect / dead-letter
// ============================================================================

/// What the delivery pipeline does with a failure of a given kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Republish with backoff
    Retry,
    /// The broker connection itself is unusable: reconnect, then retry
    Reconnect,
    /// Unfixable by retrying: dead-letter immediately
    DeadLetter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConnectionRefused,
    ConnectionReset,
    Timeout,
    AccessRefused,
    Authentication,
    PermissionDenied,
    NotFound,
    PreconditionFailed,
    ResourceLocked,
    MessageTooLarge,
    Validation,
    Routing,
    CircuitOpen,
    RateLimited,
    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 15] = [
        ErrorKind::ConnectionRefused,
        ErrorKind::ConnectionReset,
        ErrorKind::Timeout,
        ErrorKind::AccessRefused,
        ErrorKind::Authentication,
        ErrorKind::PermissionDenied,
        ErrorKind::NotFound,
        ErrorKind::PreconditionFailed,
        ErrorKind::ResourceLocked,
        ErrorKind::MessageTooLarge,
        ErrorKind::Validation,
        ErrorKind::Routing,
        ErrorKind::CircuitOpen,
        ErrorKind::RateLimited,
        ErrorKind::Unknown,
    ];

    /// Value of the `x-error-type` header
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConnectionRefused => "CONNECTION_REFUSED",
            ErrorKind::ConnectionReset => "CONNECTION_RESET",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::AccessRefused => "ACCESS_REFUSED",
            ErrorKind::Authentication => "AUTHENTICATION",
            ErrorKind::PermissionDenied => "PERMISSION_DENIED",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::PreconditionFailed => "PRECONDITION_FAILED",
            ErrorKind::ResourceLocked => "RESOURCE_LOCKED",
            ErrorKind::MessageTooLarge => "MESSAGE_TOO_LARGE",
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::Routing => "ROUTING",
            ErrorKind::CircuitOpen => "CIRCUIT_OPEN",
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::Unknown => "UNKNOWN",
        }
    }

    pub fn disposition(&self) -> Disposition {
        match self {
            ErrorKind::ConnectionRefused => Disposition::Reconnect,
            ErrorKind::ConnectionReset
            | ErrorKind::Timeout
            | ErrorKind::ResourceLocked
            | ErrorKind::CircuitOpen
            | ErrorKind::RateLimited
            | ErrorKind::Unknown => Disposition::Retry,
            ErrorKind::AccessRefused
            | ErrorKind::Authentication
            | ErrorKind::PermissionDenied
            | ErrorKind::NotFound
            | ErrorKind::PreconditionFailed
            | ErrorKind::MessageTooLarge
            | ErrorKind::Validation
            | ErrorKind::Routing => Disposition::DeadLetter,
        }
    }

    /// Whether the consumer may spend retry budget on this failure
    pub fn is_retryable(&self) -> bool {
        !matches!(self.disposition(), Disposition::DeadLetter)
    }

    /// Terminal kinds never count toward reconnect and never get swept back
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ErrorKind::AccessRefused
                | ErrorKind::Authentication
                | ErrorKind::PermissionDenied
                | ErrorKind::NotFound
                | ErrorKind::PreconditionFailed
                | ErrorKind::MessageTooLarge
                | ErrorKind::Validation
        )
    }

    /// Recoverability as judged by the dead-letter sweep.
    ///
    /// The deny-list (terminal kinds) wins; `Routing` is recoverable here
    /// because a tenant's session may have reconnected since.
    pub fn is_recoverable(&self) -> bool {
        !self.is_terminal()
    }

    /// Pattern-match an opaque error message. Only for errors that did not
    /// arrive with a structured kind.
    pub fn classify_message(message: &str) -> Option<ErrorKind> {
        let msg = message.to_ascii_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| msg.contains(n));

        // Terminal patterns are checked first so that ambiguous text such as
        // "connection refused: access refused" lands on the deny-list.
        if has(&["access refused", "access_refused", "access-refused"]) {
            Some(ErrorKind::AccessRefused)
        } else if has(&["permission denied", "forbidden", "not authorized"]) {
            Some(ErrorKind::PermissionDenied)
        } else if has(&["authentication", "unauthorized", "invalid credentials"]) {
            Some(ErrorKind::Authentication)
        } else if has(&["precondition", "inequivalent arg"]) {
            Some(ErrorKind::PreconditionFailed)
        } else if has(&["not found", "not_found", "no queue", "no exchange"]) {
            Some(ErrorKind::NotFound)
        } else if has(&["too large", "content_too_large", "frame_too_large"]) {
            Some(ErrorKind::MessageTooLarge)
        } else if has(&["validation", "invalid payload", "malformed"]) {
            Some(ErrorKind::Validation)
        } else if has(&["resource locked", "resource_locked", "exclusive"]) {
            Some(ErrorKind::ResourceLocked)
        } else if has(&["econnrefused", "connection refused"]) {
            Some(ErrorKind::ConnectionRefused)
        } else if has(&[
            "econnreset",
            "connection reset",
            "socket hang up",
            "broken pipe",
            "connection closed",
        ]) {
            Some(ErrorKind::ConnectionReset)
        } else if has(&["timed out", "timeout", "etimedout"]) {
            Some(ErrorKind::Timeout)
        } else if has(&["circuit breaker", "circuit open"]) {
            Some(ErrorKind::CircuitOpen)
        } else if has(&["rate limit", "rate-limited"]) {
            Some(ErrorKind::RateLimited)
        } else if has(&["no active session", "ambiguous destination"]) {
            Some(ErrorKind::Routing)
        } else {
            None
        }
    }

    /// Fallback classification for legacy/opaque errors. Logs every time it
    /// is hit, and louder when nothing matched, so new failure modes get
    /// reviewed instead of silently defaulting.
    pub fn classify_opaque(message: &str) -> ErrorKind {
        match Self::classify_message(message) {
            Some(kind) => {
                tracing::warn!(
                    error = %message,
                    error_type = kind.as_str(),
                    "Error classified by message pattern (no structured kind)"
                );
                kind
            }
            None => {
                tracing::warn!(
                    error = %message,
                    "Unclassified error mode, treating as UNKNOWN (retryable) - review needed"
                );
                ErrorKind::Unknown
            }
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown error type: {}", s))
    }
}

// ============================================================================
// RelayError
// ============================================================================

/// Error type shared by the relay crates
#[derive(Error, Debug)]
pub enum RelayError {
    // ===== Transport Errors =====
    #[error("Broker error ({kind}): {message}")]
    Broker { kind: ErrorKind, message: String },

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ===== Serialization Errors =====
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ===== Delivery Errors =====
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Routing error: {0}")]
    Routing(String),

    // ===== Configuration Errors =====
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Unknown error: {0}")]
    Unknown(#[from] anyhow::Error),
}

impl RelayError {
    /// Structured failure kind, falling back to message patterns only for
    /// opaque errors
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::Broker { kind, .. } => *kind,
            #[cfg(feature = "redis")]
            RelayError::Redis(e) => ErrorKind::from(e),
            #[cfg(feature = "database")]
            RelayError::Database(e) => match e {
                sqlx::Error::PoolTimedOut => ErrorKind::Timeout,
                sqlx::Error::Io(_) => ErrorKind::ConnectionReset,
                sqlx::Error::RowNotFound => ErrorKind::NotFound,
                _ => ErrorKind::classify_opaque(&e.to_string()),
            },
            RelayError::Io(e) => ErrorKind::from(e),
            RelayError::Json(_) | RelayError::Validation(_) => ErrorKind::Validation,
            RelayError::NotFound(_) => ErrorKind::NotFound,
            RelayError::Routing(_) => ErrorKind::Routing,
            RelayError::Config(_) => ErrorKind::PreconditionFailed,
            RelayError::Internal(msg) => ErrorKind::classify_opaque(msg),
            RelayError::Unknown(e) => ErrorKind::classify_opaque(&e.to_string()),
        }
    }

    /// Error code for programmatic handling
    pub fn error_code(&self) -> &'static str {
        match self {
            RelayError::Broker { .. } => "BROKER_ERROR",
            #[cfg(feature = "redis")]
            RelayError::Redis(_) => "REDIS_ERROR",
            #[cfg(feature = "database")]
            RelayError::Database(_) => "DATABASE_ERROR",
            RelayError::Io(_) => "IO_ERROR",
            RelayError::Json(_) => "JSON_ERROR",
            RelayError::Validation(_) => "VALIDATION_ERROR",
            RelayError::NotFound(_) => "NOT_FOUND",
            RelayError::Routing(_) => "ROUTING_ERROR",
            RelayError::Config(_) => "CONFIG_ERROR",
            RelayError::Internal(_) => "INTERNAL_ERROR",
            RelayError::Unknown(_) => "UNKNOWN_ERROR",
        }
    }

    /// Log this error with a level matching its disposition
    pub fn log(&self) {
        let kind = self.kind();
        match kind.disposition() {
            Disposition::DeadLetter => tracing::error!(
                error = %self,
                error_code = self.error_code(),
                error_type = kind.as_str(),
                "Terminal error"
            ),
            Disposition::Reconnect | Disposition::Retry => tracing::warn!(
                error = %self,
                error_code = self.error_code(),
                error_type = kind.as_str(),
                "Transient error"
            ),
        }
    }
}

// ============================================================================
// Helper constructors
// ============================================================================

impl RelayError {
    pub fn broker(kind: ErrorKind, msg: impl Into<String>) -> Self {
        RelayError::Broker {
            kind,
            message: msg.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        RelayError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        RelayError::NotFound(msg.into())
    }

    pub fn routing(msg: impl Into<String>) -> Self {
        RelayError::Routing(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        RelayError::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        RelayError::Internal(msg.into())
    }
}

// ============================================================================
// Structured classification of client errors
// ============================================================================

impl From<&std::io::Error> for ErrorKind {
    fn from(err: &std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        match err.kind() {
            Io::ConnectionRefused => ErrorKind::ConnectionRefused,
            Io::ConnectionReset | Io::ConnectionAborted | Io::BrokenPipe | Io::NotConnected => {
                ErrorKind::ConnectionReset
            }
            Io::TimedOut => ErrorKind::Timeout,
            Io::PermissionDenied => ErrorKind::PermissionDenied,
            Io::NotFound => ErrorKind::NotFound,
            _ => ErrorKind::classify_opaque(&err.to_string()),
        }
    }
}

#[cfg(feature = "redis")]
impl From<&redis::RedisError> for ErrorKind {
    fn from(err: &redis::RedisError) -> Self {
        if err.is_connection_refusal() {
            ErrorKind::ConnectionRefused
        } else if err.is_timeout() {
            ErrorKind::Timeout
        } else if err.is_connection_dropped() || err.is_io_error() {
            ErrorKind::ConnectionReset
        } else if err.kind() == redis::ErrorKind::AuthenticationFailed {
            ErrorKind::Authentication
        } else if err.code() == Some("NOGROUP") {
            ErrorKind::NotFound
        } else {
            ErrorKind::classify_opaque(&err.to_string())
        }
    }
}

#[cfg(feature = "amqp")]
impl From<&lapin::Error> for ErrorKind {
    fn from(err: &lapin::Error) -> Self {
        use lapin::protocol::{AMQPErrorKind, AMQPHardError, AMQPSoftError};

        match err {
            lapin::Error::ProtocolError(amqp) => match amqp.kind() {
                AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED) => ErrorKind::AccessRefused,
                AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => ErrorKind::NotFound,
                AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                    ErrorKind::PreconditionFailed
                }
                AMQPErrorKind::Soft(AMQPSoftError::RESOURCELOCKED) => ErrorKind::ResourceLocked,
                AMQPErrorKind::Soft(AMQPSoftError::CONTENTTOOLARGE) => ErrorKind::MessageTooLarge,
                AMQPErrorKind::Hard(AMQPHardError::NOTALLOWED) => ErrorKind::PermissionDenied,
                AMQPErrorKind::Hard(AMQPHardError::FRAMEERROR) => ErrorKind::MessageTooLarge,
                AMQPErrorKind::Hard(_) => ErrorKind::ConnectionReset,
                _ => ErrorKind::classify_opaque(&amqp.to_string()),
            },
            lapin::Error::IOError(io) => ErrorKind::from(io.as_ref()),
            lapin::Error::InvalidConnectionState(_) | lapin::Error::InvalidChannelState(_) => {
                ErrorKind::ConnectionReset
            }
            _ => ErrorKind::classify_opaque(&err.to_string()),
        }
    }
}

#[cfg(feature = "amqp")]
impl From<lapin::Error> for RelayError {
    fn from(err: lapin::Error) -> Self {
        let kind = ErrorKind::from(&err);
        RelayError::Broker {
            kind,
            message: err.to_string(),
        }
    }
}
