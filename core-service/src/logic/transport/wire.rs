//! Wire Contract
//!
//! `WirePayload` is serialised once, stored in the outbox as raw bytes and
//! never re-serialised. The envelope carries those bytes base64 encoded
//! with the HMAC computed over them, so the collector verifies exactly what
//! the agent signed.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::logic::detection::Alert;
use crate::logic::telemetry::event::ProcessInfo;

use super::{signing, TransportError};

/// Alert as the collector sees it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WirePayload {
    pub id: u64,
    pub agent_id: String,
    pub event_type: String,
    pub subtype: String,
    pub severity: String,
    pub score: u8,
    /// RFC 3339, alert creation time
    pub timestamp: String,
    pub host: String,
    pub signals: BTreeMap<String, Value>,
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indicators: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessInfo>,
}

impl WirePayload {
    pub fn from_alert(alert: &Alert, agent_id: &str) -> Self {
        Self {
            id: alert.id,
            agent_id: agent_id.to_string(),
            event_type: alert.event_ref.event_type.as_str().to_string(),
            subtype: alert.event_ref.subtype.clone(),
            severity: alert.severity.as_str().to_string(),
            score: alert.score,
            timestamp: alert.created_at.to_rfc3339(),
            host: alert.event_ref.host.clone(),
            signals: alert.signals.clone(),
            name: alert.name.clone(),
            message: alert.message.clone(),
            indicators: alert.indicators.clone(),
            path: alert.event_ref.path.clone(),
            process: alert.event_ref.process.clone(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TransportError> {
        serde_json::to_vec(self).map_err(|e| TransportError::Encoding(e.to_string()))
    }
}

/// What is actually transmitted (MQTT message body / HTTPS request body)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub alert_id: u64,
    /// base64 of the exact signed bytes
    pub payload: String,
    /// hex HMAC-SHA256 of the decoded payload
    pub hmac: String,
}

impl SignedEnvelope {
    pub fn seal(alert_id: u64, payload: &[u8], key: &[u8]) -> Result<Self, TransportError> {
        Ok(Self {
            alert_id,
            payload: STANDARD.encode(payload),
            hmac: signing::sign(payload, key)?,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TransportError> {
        serde_json::to_vec(self).map_err(|e| TransportError::Encoding(e.to_string()))
    }

    /// Decoded payload bytes, only if the signature holds
    pub fn open(&self, key: &[u8]) -> Result<Vec<u8>, TransportError> {
        let bytes = STANDARD
            .decode(&self.payload)
            .map_err(|e| TransportError::Encoding(format!("payload base64: {}", e)))?;
        if signing::verify(&self.hmac, &bytes, key) {
            Ok(bytes)
        } else {
            Err(TransportError::SignatureMismatch)
        }
    }
}
