//! Alert model

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Alert payload as signed by the agent; unknown fields land in `extra`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertPayload {
    pub id: u64,
    pub agent_id: String,
    pub event_type: String,
    #[serde(default)]
    pub subtype: String,
    pub severity: String,
    pub score: u8,
    pub timestamp: String,
    pub host: String,
    pub signals: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub message: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredAlert {
    pub received_at: DateTime<Utc>,
    #[serde(flatten)]
    pub alert: AlertPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStatus {
    Accepted,
    Duplicate,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IngestResponse {
    pub alert_id: u64,
    pub status: IngestStatus,
}

#[derive(Debug, Deserialize, Default)]
pub struct AlertFilter {
    pub agent_id: Option<String>,
    pub severity: Option<String>,
    pub limit: Option<usize>,
}
