// ============================================================================
// Relay Types - Wire Data Types
// ============================================================================
//
// Data structures shared by every relay component. No dependencies on
// brokers, stores or business logic.
//
// Contents:
// - Domain events (message-received, send-command)
// - Queue message envelope and its metadata
// - Broker header names used for failure classification
//
// ============================================================================

pub mod headers;
pub mod message;

pub use message::*;
