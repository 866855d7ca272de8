//! Central Configuration Constants
//!
//! Single source of truth for defaults that are not part of the YAML config.
//! To change where the agent keeps its state, only edit this file.

use std::path::PathBuf;

/// App version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// App name
pub const APP_NAME: &str = "RTM Ransomware Shield";

/// Directory name under the local data dir
pub const DATA_DIR_NAME: &str = "rtm-agent";

/// Environment variable pointing at the agent config file
pub const CONFIG_PATH_ENV: &str = "RTM_AGENT_CONFIG";

/// Default environment variable holding the shared HMAC secret
pub const DEFAULT_HMAC_KEY_ENV: &str = "RTM_HMAC_KEY";

/// SQLite file holding ledger, outbox and id sequence
pub const STORE_FILE: &str = "agent.db";

/// Audit trail directory (JSONL)
pub const AUDIT_DIR: &str = "audit";

/// Quarantine folder name under the user's home
pub const QUARANTINE_FOLDER: &str = "RansomwareQuarantine";

/// Capacity of the single intake queue between sensors and the detection worker
pub const INTAKE_QUEUE_CAPACITY: usize = 4096;

/// Capacity of the queue between the detection worker and the response worker
pub const RESPONSE_QUEUE_CAPACITY: usize = 1024;

/// Capacity of the notification broadcast bus
pub const NOTIFICATION_BUS_CAPACITY: usize = 256;

/// How often the transport thread prunes old ledger and outbox rows
pub const RETENTION_SWEEP_INTERVAL_SECS: u64 = 3600;

/// How often the detection worker wakes up without input (flushes burst windows)
pub const WORKER_TICK_MS: u64 = 250;

// ============================================
// Helper functions to read from env with fallback
// ============================================

/// Default data directory (`<local data dir>/rtm-agent`)
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DATA_DIR_NAME)
}

/// Get config path from environment or use default
pub fn get_config_path() -> PathBuf {
    std::env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| default_data_dir().join("config.yaml"))
}

/// Default quarantine directory (`~/RansomwareQuarantine`)
pub fn default_quarantine_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(QUARANTINE_FOLDER)
}
