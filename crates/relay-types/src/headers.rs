//! Broker header names.
//!
//! Routing headers are stamped on every publish; the `x-error-*` family is
//! only present on dead-lettered messages.

pub const MESSAGE_TYPE: &str = "x-message-type";
pub const TENANT_ID: &str = "x-tenant-id";
pub const SENDER: &str = "x-sender";
pub const PUBLISHED_AT: &str = "x-published-at";

pub const RETRY_COUNT: &str = "x-retry-count";
pub const MAX_RETRIES: &str = "x-max-retries";
pub const ERROR_MESSAGE: &str = "x-error-message";
pub const ERROR_TYPE: &str = "x-error-type";
pub const FAILED_AT: &str = "x-failed-at";
pub const ORIGINAL_EXCHANGE: &str = "x-original-exchange";
pub const ORIGINAL_ROUTING_KEY: &str = "x-original-routing-key";
pub const ORIGINAL_QUEUE: &str = "x-original-queue";

/// Stamped once a send command passes admission; retries skip the limiter
pub const ADMITTED: &str = "x-admitted";

/// RabbitMQ's own dead-letter bookkeeping, set when a queue dead-letters a
/// delivery
pub const FIRST_DEATH_REASON: &str = "x-first-death-reason";
pub const FIRST_DEATH_QUEUE: &str = "x-first-death-queue";
pub const FIRST_DEATH_EXCHANGE: &str = "x-first-death-exchange";

/// Queue arguments
pub const ARG_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
pub const ARG_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
