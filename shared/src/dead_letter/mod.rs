// ============================================================================
// Dead letters
// ============================================================================
//
//   relay.dead_letters ──▶ DeadLetterIngestor ──▶ DeadLetterStore (KV, 7d)
//                                                     │
//                          RetryCoordinator (sweep) ──┤── retry  → original destination
//                                                     └── archive → dlq:archive:<day> (30d)
//
// Every state change of a record is appended to the day's archive list, so
// nothing leaves the store without an audit entry.
//
// ============================================================================

mod coordinator;
mod ingest;
mod record;
mod store;

pub use coordinator::{RetryCoordinator, SweepReport};
pub use ingest::DeadLetterIngestor;
pub use record::{ArchiveAction, ArchiveEntry, DeadLetterRecord};
pub use store::DeadLetterStore;
