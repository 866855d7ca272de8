//! Detection Module - Event Scoring
//!
//! Turns canonical events into scored alerts.
//!
//! # Components
//! - `burst.rs`: per-watch-path file write rate (tumbling 1s windows)
//! - `entropy.rs`: Shannon entropy of renamed content + extension watchlist
//! - `heuristics.rs`: LOLBin / keyword / log lookup table
//! - `engine.rs`: combines the three by maximum severity
//! - `types.rs`: Severity, Alert, id sequence

pub mod burst;
pub mod engine;
pub mod entropy;
pub mod heuristics;
pub mod types;

pub use engine::DetectionEngine;
pub use types::{Alert, AlertSequence, Finding, Severity};
