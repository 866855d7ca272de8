//! Canonical Telemetry Event
//!
//! Every sensor record is turned into one `Event` by the normalizer.
//! Events are immutable once built and are handed to the detection
//! engine by value.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// EVENT KIND
// ============================================================================

/// Top-level category of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    File,
    Process,
    Log,
    Script,
    Resource,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::File => "file",
            EventKind::Process => "process",
            EventKind::Log => "log",
            EventKind::Script => "script",
            EventKind::Resource => "resource",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// TIMESTAMP
// ============================================================================

/// Process-local monotonic origin
static MONO_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic + wall clock pair
///
/// `mono_ns` is used for windowing (never goes backwards), `wall` for
/// anything that leaves the host.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Timestamp {
    pub mono_ns: u64,
    pub wall: DateTime<Utc>,
}

impl Timestamp {
    pub fn now() -> Self {
        Self {
            mono_ns: MONO_EPOCH.elapsed().as_nanos() as u64,
            wall: Utc::now(),
        }
    }

    /// Build a timestamp from explicit parts (replay, tests)
    pub fn from_parts(mono_ns: u64, wall: DateTime<Utc>) -> Self {
        Self { mono_ns, wall }
    }
}

/// Current monotonic reading in nanoseconds
pub fn mono_now_ns() -> u64 {
    MONO_EPOCH.elapsed().as_nanos() as u64
}

// ============================================================================
// PROCESS INFO
// ============================================================================

/// Process attached to an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    #[serde(default)]
    pub command_line: String,
    #[serde(default)]
    pub parent_pid: Option<u32>,
}

impl ProcessInfo {
    pub fn new(pid: u32, name: &str) -> Self {
        Self {
            pid,
            name: name.to_string(),
            command_line: String::new(),
            parent_pid: None,
        }
    }

    pub fn with_command_line(mut self, command_line: &str) -> Self {
        self.command_line = command_line.to_string();
        self
    }

    pub fn with_parent(mut self, parent_pid: Option<u32>) -> Self {
        self.parent_pid = parent_pid;
        self
    }

    /// Lowercase image name without directory or `.exe` suffix
    pub fn image_stem(&self) -> String {
        let lower = self.name.to_lowercase();
        let base = lower.rsplit(['\\', '/']).next().unwrap_or(&lower);
        base.strip_suffix(".exe").unwrap_or(base).to_string()
    }
}

// ============================================================================
// EVENT
// ============================================================================

/// Raw numeric/string features collected with an event
pub type Signals = BTreeMap<String, Value>;

/// Canonical unit of observation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: Timestamp,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub subtype: String,
    pub host: String,
    pub process: Option<ProcessInfo>,
    pub path: Option<PathBuf>,
    pub raw_signals: Signals,
    pub admin_privileges: bool,
}

impl Event {
    pub fn new(kind: EventKind, subtype: &str, host: &str) -> Self {
        Self {
            timestamp: Timestamp::now(),
            kind,
            subtype: subtype.to_string(),
            host: host.to_string(),
            process: None,
            path: None,
            raw_signals: Signals::new(),
            admin_privileges: false,
        }
    }

    // Builder pattern methods
    pub fn at(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_process(mut self, process: ProcessInfo) -> Self {
        self.process = Some(process);
        self
    }

    pub fn with_path(mut self, path: PathBuf) -> Self {
        self.path = Some(path);
        self
    }

    pub fn with_signal(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.raw_signals.insert(name.to_string(), value.into());
        self
    }

    pub fn with_admin(mut self, admin: bool) -> Self {
        self.admin_privileges = admin;
        self
    }

    pub fn signal_f64(&self, name: &str) -> Option<f64> {
        self.raw_signals.get(name).and_then(Value::as_f64)
    }

    pub fn signal_str(&self, name: &str) -> Option<&str> {
        self.raw_signals.get(name).and_then(Value::as_str)
    }

    pub fn signal_flag(&self, name: &str) -> bool {
        self.raw_signals
            .get(name)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Lowercased file name of `path`, if any
    pub fn file_name_lower(&self) -> Option<String> {
        self.path
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_lowercase())
    }

    /// Lowercased extension of `path` including the leading dot
    pub fn extension_lower(&self) -> Option<String> {
        self.path
            .as_ref()
            .and_then(|p| p.extension())
            .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
    }

    /// Compact copy carried by alerts
    pub fn summary(&self) -> EventSummary {
        EventSummary {
            event_type: self.kind,
            subtype: self.subtype.clone(),
            host: self.host.clone(),
            path: self.path.as_ref().map(|p| p.to_string_lossy().to_string()),
            process: self.process.clone(),
            timestamp: self.timestamp.wall,
            mono_ns: self.timestamp.mono_ns,
            admin_privileges: self.admin_privileges,
        }
    }
}

/// Summary of the event that triggered an alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSummary {
    pub event_type: EventKind,
    pub subtype: String,
    pub host: String,
    pub path: Option<String>,
    pub process: Option<ProcessInfo>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub mono_ns: u64,
    #[serde(default)]
    pub admin_privileges: bool,
}

// ============================================================================
// TESTS
// ============================================================================
