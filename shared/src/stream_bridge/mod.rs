// ============================================================================
// Stream bridge
// ============================================================================
//
//   relay.inbound ──▶ append ──▶ ack delivery
//                       │
//                       ▼
//   stream {prefix}{queue}, group {group}
//                       │ read_group (pending first, then new)
//                       ▼
//                MessageStore::save ──▶ ack entry
//
// Nothing is settled upstream before it is safe downstream, so every hop is
// at-least-once; the store's idempotent save makes the end result exactly one
// row per event.
//
// ============================================================================

mod log;
mod relay;

pub use log::{MemoryStreamLog, ReadCursor, RedisStreamLog, StreamEntry, StreamLog, StreamLogError};
pub use relay::{
    FIELD_ID, FIELD_PAYLOAD, FIELD_ROUTING_KEY, FIELD_TENANT_ID, StreamBridge, record_from_entry,
};
