//! Agent Health Snapshot
//!
//! Collected periodically by `main` and written to `status.json` in the
//! data dir, where the dashboard or the `status` subcommand picks it up.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::logic::pipeline::IntakeCounts;
use crate::logic::response::network;
use crate::logic::telemetry::recorder;
use crate::logic::transport::{OutboxCounts, TransportStatus};

pub const STATUS_FILE: &str = "status.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStatus {
    pub pending: u64,
    pub sent: u64,
    pub failed: u64,
    pub dropped: u64,
}

impl From<OutboxCounts> for QueueStatus {
    fn from(c: OutboxCounts) -> Self {
        Self {
            pending: c.pending,
            sent: c.sent,
            failed: c.failed,
            dropped: c.dropped,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntakeStatus {
    pub accepted: u64,
    pub malformed: u64,
    pub filtered: u64,
    pub backpressure: u64,
}

impl From<IntakeCounts> for IntakeStatus {
    fn from(c: IntakeCounts) -> Self {
        Self {
            accepted: c.accepted,
            malformed: c.malformed,
            filtered: c.filtered,
            backpressure: c.backpressure,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub agent_id: String,
    pub version: String,
    pub uptime_secs: u64,
    pub config_generation: u64,
    pub playbooks: usize,
    pub sensors_running: usize,
    pub intake: IntakeStatus,
    pub outbox: QueueStatus,
    pub transport_endpoint: String,
    pub transport_connected: bool,
    pub delivered: u64,
    pub key_misconfigured: bool,
    pub last_transport_error: Option<String>,
    pub audit_records: u64,
    #[serde(default)]
    pub audit_log: Option<PathBuf>,
    /// Interfaces disabled by `isolate_network` and not yet restored
    #[serde(default)]
    pub isolated_interfaces: Vec<String>,
    pub collected_at: DateTime<Utc>,
}

impl AgentStatus {
    /// Anything an operator has to act on
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.key_misconfigured {
            problems.push("collector keeps rejecting signatures: check the HMAC key".to_string());
        }
        if self.outbox.dropped > 0 {
            problems.push(format!("{} alert(s) dropped after max retries", self.outbox.dropped));
        }
        if !self.isolated_interfaces.is_empty() {
            problems.push(format!(
                "network isolated ({}): run restore-network once the host is clean",
                self.isolated_interfaces.join(", ")
            ));
        }
        if self.sensors_running == 0 {
            problems.push("no sensor is running".to_string());
        }
        problems
    }
}

pub struct StatusInputs<'a> {
    pub agent_id: &'a str,
    pub uptime_secs: u64,
    pub config_generation: u64,
    pub playbooks: usize,
    pub sensors_running: usize,
    pub intake: IntakeCounts,
    pub outbox: OutboxCounts,
    pub transport: &'a TransportStatus,
}

pub fn collect(inputs: StatusInputs<'_>) -> AgentStatus {
    AgentStatus {
        agent_id: inputs.agent_id.to_string(),
        version: crate::constants::APP_VERSION.to_string(),
        uptime_secs: inputs.uptime_secs,
        config_generation: inputs.config_generation,
        playbooks: inputs.playbooks,
        sensors_running: inputs.sensors_running,
        intake: inputs.intake.into(),
        outbox: inputs.outbox.into(),
        transport_endpoint: inputs.transport.endpoint.clone(),
        transport_connected: inputs.transport.connected,
        delivered: inputs.transport.delivered,
        key_misconfigured: inputs.transport.key_misconfigured,
        last_transport_error: inputs.transport.last_error.clone(),
        audit_records: recorder::records_written(),
        audit_log: recorder::current_log_file(),
        isolated_interfaces: network::isolated_interfaces(),
        collected_at: Utc::now(),
    }
}

pub fn status_path(data_dir: &Path) -> PathBuf {
    data_dir.join(STATUS_FILE)
}

/// Write via a temp file so readers never see a partial document
pub fn write(data_dir: &Path, status: &AgentStatus) -> std::io::Result<()> {
    let json = serde_json::to_vec_pretty(status)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let tmp = data_dir.join(format!("{}.tmp", STATUS_FILE));
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, status_path(data_dir))
}

pub fn read(data_dir: &Path) -> std::io::Result<AgentStatus> {
    let bytes = std::fs::read(status_path(data_dir))?;
    serde_json::from_slice(&bytes).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}
