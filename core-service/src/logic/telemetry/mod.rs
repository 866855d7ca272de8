//! Telemetry Module
//!
//! ## Structure
//! - `event.rs` - canonical Event (immutable, timestamped)
//! - `normalizer.rs` - raw sensor payload -> Event
//! - `recorder.rs` - append-only JSONL audit trail

pub mod event;
pub mod normalizer;
pub mod recorder;

pub use event::{Event, EventKind, EventSummary, ProcessInfo, Timestamp};
pub use normalizer::{NormalizeError, Normalizer, RawSensorEvent};
pub use recorder::AuditRecord;
