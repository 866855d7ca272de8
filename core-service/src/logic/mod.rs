//! Logic Module - Detection & Response Engines
//!
//! Data flow: `sensors/` -> `telemetry/` (normalizer) -> `pipeline/`
//! (single detection worker) -> `transport/` (always) and `playbook/`
//! (when triggered) -> `response/` executors.
//!
//! ## Layout
//! - `config/` - YAML config, validated snapshots, hot reload
//! - `detection/` - burst, entropy, heuristic scoring
//! - `playbook/` - SOAR matching, execution, idempotency ledger
//! - `response/` - kill / isolate / quarantine / notify executors
//! - `transport/` - signing, durable outbox, MQTT/HTTPS delivery
//! - `store.rs` - shared SQLite database

// Core modules
pub mod events;
pub mod status;
pub mod store;

// Pipeline stages
pub mod config;
pub mod detection;
pub mod pipeline;
pub mod playbook;
pub mod response;
pub mod sensors;
pub mod telemetry;
pub mod transport;
