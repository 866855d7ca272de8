//! Response Module - Action Executors
//!
//! # Components
//! - `actions.rs`: platform capability trait, process kill, action executor
//! - `network.rs`: interface isolation (Windows netsh / Linux ip link)
//! - `file_quarantine.rs`: quarantine folder with metadata and restore
//! - `types.rs`: ActionError, Outcome, ActionResult, QuarantineEntry, Notification

pub mod actions;
pub mod file_quarantine;
pub mod network;
pub mod types;

pub use actions::{ActionExecutor, ActionTarget, HostPlatform, ResponsePlatform};
pub use file_quarantine::QuarantineManager;
pub use types::{ActionError, ActionResult, Notification, Outcome, QuarantineEntry};
