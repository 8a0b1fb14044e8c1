// ============================================================================
// Relay Shared - resilient message delivery
// ============================================================================
//
// Broker topology and publishing, the retrying consumer, dead-letter parking
// and its retry sweep, per-dependency circuit breakers, admission control and
// the broker → append log → message store bridge.
//
// Data flow:
//   inbound event → Producer → relay.inbound → StreamBridge → stream → MessageStore
//   send command  → Producer → relay.outbound → ReliableConsumer → session provider
//                                                    └─ failure → DLX → DeadLetterStore
//
// ============================================================================

pub mod broker;
pub mod circuit_breaker;
pub mod commands;
pub mod dead_letter;
pub mod persistence;
pub mod rate_limit;
pub mod runtime;
pub mod scheduler;
pub mod sessions;
pub mod storage;
pub mod stream_bridge;
pub mod utils;

pub use relay_error::{Disposition, ErrorKind, RelayError, RelayResult};
pub use relay_types as types;
