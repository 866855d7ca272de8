//! Playbook Module (SOAR)
//!
//! ## Structure
//! - `types`: Playbook, Triggers, ActionKind, ActionSpec
//! - `loader`: ordered loading from inline config + files/directories
//! - `ledger`: durable idempotency ledger and target claims
//! - `engine`: matching and ordered execution

pub mod engine;
pub mod ledger;
pub mod loader;
pub mod types;


pub use engine::PlaybookEngine;
pub use ledger::Ledger;
pub use loader::load_playbooks;
pub use types::{ActionKind, ActionSpec, Playbook, PlaybookError, Triggers};
