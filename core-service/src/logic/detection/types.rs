//! Detection Types
//!
//! Severity, Alert and the id sequence. No scoring logic lives here.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::logic::store::Store;
use crate::logic::telemetry::event::{Event, EventSummary};

// ============================================================================
// SEVERITY
// ============================================================================

/// Alert severity, totally ordered INFO < WARNING < ERROR < CRITICAL
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "INFO" => Ok(Severity::Info),
            "WARNING" | "WARN" => Ok(Severity::Warning),
            "ERROR" => Ok(Severity::Error),
            "CRITICAL" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

// ============================================================================
// FINDING
// ============================================================================

/// One detector's verdict on one event, before an id is assigned
#[derive(Debug, Clone)]
pub struct Finding {
    pub severity: Severity,
    pub score: u8,
    pub name: String,
    pub message: String,
    pub indicators: Vec<String>,
    pub signals: BTreeMap<String, Value>,
    pub auto_contain: bool,
}

impl Finding {
    pub fn new(severity: Severity, score: u8, name: &str, message: String) -> Self {
        Self {
            severity,
            score: score.min(100),
            name: name.to_string(),
            message,
            indicators: Vec::new(),
            signals: BTreeMap::new(),
            auto_contain: false,
        }
    }

    pub fn indicator(mut self, tag: &str) -> Self {
        if !self.indicators.iter().any(|t| t == tag) {
            self.indicators.push(tag.to_string());
        }
        self
    }

    pub fn signal(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.signals.insert(name.to_string(), value.into());
        self
    }

    pub fn contain(mut self) -> Self {
        self.auto_contain = true;
        self
    }

    /// Ordering used when several detectors fire on one event
    pub fn outranks(&self, other: &Finding) -> bool {
        (self.severity, self.score) > (other.severity, other.score)
    }
}

// ============================================================================
// ALERT
// ============================================================================

/// Detection verdict. Never modified after routing; each consumer
/// (outbox, playbooks, audit) gets its own clone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: u64,
    pub event_ref: EventSummary,
    pub severity: Severity,
    pub score: u8,
    pub name: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub indicators: Vec<String>,
    #[serde(default)]
    pub signals: BTreeMap<String, Value>,
    #[serde(default)]
    pub auto_contain: bool,
}

impl Alert {
    pub fn from_finding(id: u64, event_ref: EventSummary, finding: Finding) -> Self {
        Self {
            id,
            event_ref,
            severity: finding.severity,
            score: finding.score,
            name: finding.name,
            message: finding.message,
            created_at: Utc::now(),
            indicators: finding.indicators,
            signals: finding.signals,
            auto_contain: finding.auto_contain,
        }
    }

    /// Event raw signals merged with detector signals (detector wins)
    pub fn merged_signals(event: &Event, finding: &Finding) -> BTreeMap<String, Value> {
        let mut merged = event.raw_signals.clone();
        for (k, v) in &finding.signals {
            merged.insert(k.clone(), v.clone());
        }
        merged
    }

    pub fn has_indicator(&self, tag: &str) -> bool {
        self.indicators.iter().any(|t| t == tag)
    }
}

// ============================================================================
// ID SEQUENCE
// ============================================================================

/// Ids reserved from the store per round trip
const ID_BLOCK: u64 = 256;

struct SeqState {
    next: u64,
    ceiling: u64,
}

/// Unique, monotonic alert ids that survive restarts
///
/// Ids are reserved from the store in blocks; a restart skips the unused
/// part of the last block, so ids stay unique without a write per alert.
pub struct AlertSequence {
    state: Mutex<SeqState>,
    store: Option<Arc<Store>>,
}

impl AlertSequence {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            state: Mutex::new(SeqState { next: 1, ceiling: 1 }),
            store: Some(store),
        }
    }

    /// Process-local sequence starting at 1
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(SeqState {
                next: 1,
                ceiling: u64::MAX,
            }),
            store: None,
        }
    }

    pub fn next_id(&self) -> u64 {
        let mut state = self.state.lock();
        if state.next >= state.ceiling {
            if let Some(store) = &self.store {
                match store.reserve_ids(ID_BLOCK) {
                    Ok((start, end)) => {
                        state.next = start.max(state.next);
                        state.ceiling = end.max(state.next + 1);
                    }
                    Err(e) => {
                        // Keep issuing in-process ids; uniqueness holds until restart
                        log::error!("[Detection] Failed to reserve alert ids: {}", e);
                        state.ceiling = state.next + ID_BLOCK;
                    }
                }
            }
        }
        let id = state.next;
        state.next += 1;
        id
    }
}
