//! Agent Configuration Types
//!
//! YAML shape of the agent config file. Every section has defaults so a
//! minimal file only needs `watch_paths`, the outbound endpoint and the
//! playbooks.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::logic::playbook::types::Playbook;

// ============================================================================
// TOP LEVEL
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub agent: AgentIdentity,
    pub detection: DetectionConfig,
    pub outbound: OutboundConfig,
    pub security: SecurityConfig,
    pub response: ResponseConfig,
    /// Ordered playbook files/directories, evaluated after inline playbooks
    pub playbook_sources: Vec<PathBuf>,
    /// Inline playbooks, evaluated first
    pub playbooks: Vec<Playbook>,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentIdentity {
    pub id: String,
    pub name: String,
}

impl Default for AgentIdentity {
    fn default() -> Self {
        Self {
            id: "agent-001".to_string(),
            name: "rtm-agent".to_string(),
        }
    }
}

// ============================================================================
// DETECTION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub file_burst_threshold_per_sec: u32,
    /// Per-process CPU percent
    pub cpu_usage_threshold: f32,
    /// Bytes written per second by one process
    pub io_write_threshold_bytes: u64,
    /// Average Shannon entropy (bits/byte) above which content looks encrypted
    pub entropy_threshold: f64,
    /// Every sample must also exceed this
    pub entropy_min_sample_threshold: f64,
    pub watch_paths: Vec<PathBuf>,
    /// Extensions (with or without leading dot), case-insensitive
    pub ext_watchlist: Vec<String>,
    pub ransom_note_names: Vec<String>,
    /// Seconds between resource monitor samples
    pub resource_interval_secs: u64,
    /// Milliseconds between process-start polls
    pub process_poll_ms: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            file_burst_threshold_per_sec: 50,
            cpu_usage_threshold: 80.0,
            io_write_threshold_bytes: 50 * 1024 * 1024,
            entropy_threshold: 7.3,
            entropy_min_sample_threshold: 7.0,
            watch_paths: Vec::new(),
            ext_watchlist: [
                ".locked", ".encrypted", ".crypt", ".crypted", ".enc", ".wnry", ".wncry", ".wcry",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            ransom_note_names: [
                "README.txt",
                "HOW_TO_DECRYPT.txt",
                "DECRYPT_INSTRUCTIONS.html",
                "!!!READ_ME!!!.txt",
                "YOUR_FILES_ARE_ENCRYPTED.txt",
                "HELP_DECRYPT.txt",
                "HELP_RESTORE_FILES.txt",
                "HOW_TO_BACK_FILES.txt",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            resource_interval_secs: 5,
            process_poll_ms: 500,
        }
    }
}

impl DetectionConfig {
    /// Normalised watchlist: lowercase, leading dot
    pub fn normalized_watchlist(&self) -> Vec<String> {
        self.ext_watchlist
            .iter()
            .map(|e| {
                let e = e.trim().to_lowercase();
                if e.starts_with('.') {
                    e
                } else {
                    format!(".{}", e)
                }
            })
            .collect()
    }
}

// ============================================================================
// OUTBOUND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboundMode {
    #[default]
    Mqtt,
    Https,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboundConfig {
    pub mode: OutboundMode,
    pub mqtt: MqttConfig,
    pub https: HttpsConfig,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    /// Environment variable holding the broker password
    pub password_env: Option<String>,
    pub topic: String,
    /// Defaults to `agent-<agent.id>`
    pub client_id: Option<String>,
    pub cafile: Option<PathBuf>,
    /// Plain TCP for local brokers; TLS otherwise
    pub tls: bool,
    pub ack_timeout_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 8883,
            username: None,
            password_env: None,
            topic: "rtm/events".to_string(),
            client_id: None,
            cafile: None,
            tls: true,
            ack_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpsConfig {
    pub url: String,
    pub cafile: Option<PathBuf>,
    pub timeout_secs: u64,
}

impl Default for HttpsConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            cafile: None,
            timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Attempts before an alert is archived as DROPPED
    pub max_retries: u32,
    /// Delivery loop cadence
    pub poll_interval_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 60_000,
            max_retries: 20,
            poll_interval_ms: 250,
        }
    }
}

// ============================================================================
// SECURITY / RESPONSE / STORAGE
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Environment variable holding the shared HMAC secret
    pub hmac_key_env: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            hmac_key_env: crate::constants::DEFAULT_HMAC_KEY_ENV.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseConfig {
    /// Defaults to `~/RansomwareQuarantine`
    pub quarantine_dir: Option<PathBuf>,
    /// Re-publish notify actions as follow-up INFO alerts
    pub notify_republish: bool,
}

impl ResponseConfig {
    pub fn quarantine_dir(&self) -> PathBuf {
        self.quarantine_dir
            .clone()
            .unwrap_or_else(crate::constants::default_quarantine_dir)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Defaults to `<local data dir>/rtm-agent`
    pub data_dir: Option<PathBuf>,
    /// Age after which ledger rows and DROPPED outbox rows are pruned
    pub retention_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            retention_days: 30,
        }
    }
}

impl StorageConfig {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(crate::constants::default_data_dir)
    }
}
