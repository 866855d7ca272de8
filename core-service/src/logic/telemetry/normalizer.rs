//! Event Normalizer
//!
//! Converts sensor-specific records into canonical `Event`s.
//!
//! Never blocks on name resolution: the hostname is resolved once on a
//! background thread. Until it is known, events carry an empty host and a
//! `partial` signal instead of stalling the sensor.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::logic::detection::entropy::{self, EntropyReading};

use super::event::{Event, EventKind, ProcessInfo};

// ============================================================================
// RAW SENSOR RECORDS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOp {
    Create,
    Modify,
    Rename,
    Delete,
}

impl FileOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileOp::Create => "create",
            FileOp::Modify => "modify",
            FileOp::Rename => "rename",
            FileOp::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceMetric {
    Cpu,
    DiskWrite,
}

/// One record as produced by a sensor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "sensor", rename_all = "snake_case")]
pub enum RawSensorEvent {
    FileSystem {
        op: FileOp,
        path: PathBuf,
        #[serde(default)]
        old_path: Option<PathBuf>,
        /// Content already read by the sensor; otherwise sampled from disk on rename
        #[serde(default)]
        content_sample: Option<Vec<u8>>,
        #[serde(default)]
        pid: Option<u32>,
        #[serde(default)]
        process_name: Option<String>,
    },
    ProcessStart {
        pid: u32,
        #[serde(default)]
        parent_pid: Option<u32>,
        name: String,
        #[serde(default)]
        command_line: String,
        #[serde(default)]
        elevated: bool,
    },
    SecurityLog {
        event_id: u32,
        #[serde(default)]
        provider: String,
        #[serde(default)]
        message: String,
        #[serde(default)]
        pid: Option<u32>,
        #[serde(default)]
        image: Option<String>,
        #[serde(default)]
        command_line: Option<String>,
        #[serde(default)]
        target_path: Option<PathBuf>,
    },
    ScriptLog {
        engine: String,
        script_text: String,
        #[serde(default)]
        pid: Option<u32>,
        #[serde(default)]
        script_path: Option<PathBuf>,
    },
    Resource {
        metric: ResourceMetric,
        pid: u32,
        name: String,
        value: f64,
    },
}

impl RawSensorEvent {
    pub fn sensor_kind(&self) -> EventKind {
        match self {
            RawSensorEvent::FileSystem { .. } => EventKind::File,
            RawSensorEvent::ProcessStart { .. } => EventKind::Process,
            RawSensorEvent::SecurityLog { .. } => EventKind::Log,
            RawSensorEvent::ScriptLog { .. } => EventKind::Script,
            RawSensorEvent::Resource { .. } => EventKind::Resource,
        }
    }
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("malformed {kind} input: {reason}")]
    MalformedInput { kind: EventKind, reason: String },
    /// Agent's own activity (quarantine moves); dropped quietly
    #[error("filtered: {0}")]
    Filtered(String),
}

fn malformed(kind: EventKind, reason: &str) -> NormalizeError {
    NormalizeError::MalformedInput {
        kind,
        reason: reason.to_string(),
    }
}

// ============================================================================
// SECURITY LOG CLASSIFICATION
// ============================================================================

/// Map a security-log record to an event subtype
pub fn classify_security_log(event_id: u32, provider: &str, message: &str) -> &'static str {
    let provider = provider.to_lowercase();
    let is_sysmon = provider.contains("sysmon");
    match event_id {
        1 if is_sysmon => "sysmon_process_create",
        11 if is_sysmon => "sysmon_file_create",
        13 if is_sysmon => "sysmon_reg_set",
        4104 => "ps_scriptblock",
        7045 | 4697 => "service_install",
        _ if message.to_lowercase().contains("vssadmin delete shadows") => "vss_delete",
        _ => "win_event",
    }
}

// ============================================================================
// NORMALIZER
// ============================================================================

/// Cheap to clone; one per sensor thread
#[derive(Clone)]
pub struct Normalizer {
    host: Arc<OnceCell<String>>,
    quarantine_dir: PathBuf,
}

impl Normalizer {
    /// Starts hostname resolution in the background
    pub fn new(quarantine_dir: PathBuf) -> Self {
        let host = Arc::new(OnceCell::new());
        let cell = host.clone();
        let spawned = std::thread::Builder::new()
            .name("hostname-resolve".into())
            .spawn(move || {
                let name = hostname::get()
                    .map(|h| h.to_string_lossy().to_string())
                    .unwrap_or_else(|_| "unknown-host".to_string());
                let _ = cell.set(name);
            });
        if let Err(e) = spawned {
            log::warn!("[Normalizer] Hostname thread failed to start: {}", e);
        }
        Self {
            host,
            quarantine_dir,
        }
    }

    /// Fixed hostname (tests, replay)
    pub fn with_host(host: &str, quarantine_dir: PathBuf) -> Self {
        let cell = OnceCell::new();
        let _ = cell.set(host.to_string());
        Self {
            host: Arc::new(cell),
            quarantine_dir,
        }
    }

    pub fn host(&self) -> Option<&str> {
        self.host.get().map(String::as_str)
    }

    pub fn normalize(&self, raw: RawSensorEvent) -> Result<Event, NormalizeError> {
        let kind = raw.sensor_kind();
        let (host, partial) = match self.host.get() {
            Some(h) => (h.as_str(), false),
            None => ("", true),
        };

        let event = match raw {
            RawSensorEvent::FileSystem {
                op,
                path,
                old_path,
                content_sample,
                pid,
                process_name,
            } => self.file_event(host, op, path, old_path, content_sample, pid, process_name)?,

            RawSensorEvent::ProcessStart {
                pid,
                parent_pid,
                name,
                command_line,
                elevated,
            } => {
                if pid == 0 || name.trim().is_empty() {
                    return Err(malformed(kind, "process start without pid or image name"));
                }
                Event::new(EventKind::Process, "start", host)
                    .with_process(
                        ProcessInfo::new(pid, &name)
                            .with_command_line(&command_line)
                            .with_parent(parent_pid),
                    )
                    .with_admin(elevated)
            }

            RawSensorEvent::SecurityLog {
                event_id,
                provider,
                message,
                pid,
                image,
                command_line,
                target_path,
            } => {
                if event_id == 0 && message.trim().is_empty() {
                    return Err(malformed(kind, "log record without id or message"));
                }
                let subtype = classify_security_log(event_id, &provider, &message);
                let mut event = Event::new(EventKind::Log, subtype, host)
                    .with_signal("event_id", event_id)
                    .with_signal("provider", provider)
                    .with_signal("message", message);
                if let Some(pid) = pid {
                    let name = image.unwrap_or_default();
                    event = event.with_process(
                        ProcessInfo::new(pid, &name)
                            .with_command_line(command_line.as_deref().unwrap_or_default()),
                    );
                }
                if let Some(path) = target_path {
                    event = event.with_path(path);
                }
                event
            }

            RawSensorEvent::ScriptLog {
                engine,
                script_text,
                pid,
                script_path,
            } => {
                if script_text.trim().is_empty() {
                    return Err(malformed(kind, "empty script text"));
                }
                let mut event = Event::new(EventKind::Script, "script_exec", host)
                    .with_signal("engine", engine.clone())
                    .with_signal("script_text", script_text);
                if let Some(pid) = pid {
                    event = event.with_process(ProcessInfo::new(pid, &engine));
                }
                if let Some(path) = script_path {
                    event = event.with_path(path);
                }
                event
            }

            RawSensorEvent::Resource {
                metric,
                pid,
                name,
                value,
            } => {
                if !value.is_finite() || value < 0.0 {
                    return Err(malformed(kind, "non-finite resource reading"));
                }
                let (subtype, signal) = match metric {
                    ResourceMetric::Cpu => ("high_cpu", "cpu_percent"),
                    ResourceMetric::DiskWrite => ("high_disk_write", "disk_write_bytes"),
                };
                Event::new(EventKind::Resource, subtype, host)
                    .with_process(ProcessInfo::new(pid, &name))
                    .with_signal(signal, value)
            }
        };

        Ok(if partial {
            event.with_signal("partial", true)
        } else {
            event
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn file_event(
        &self,
        host: &str,
        op: FileOp,
        path: PathBuf,
        old_path: Option<PathBuf>,
        content_sample: Option<Vec<u8>>,
        pid: Option<u32>,
        process_name: Option<String>,
    ) -> Result<Event, NormalizeError> {
        if path.as_os_str().is_empty() {
            return Err(malformed(EventKind::File, "empty path"));
        }
        if self.is_quarantine_path(&path) {
            return Err(NormalizeError::Filtered(format!(
                "quarantine activity {:?}",
                path
            )));
        }
        if op == FileOp::Rename && old_path.is_none() {
            return Err(malformed(EventKind::File, "rename without source path"));
        }

        let mut event = Event::new(EventKind::File, op.as_str(), host);
        if let Some(old) = &old_path {
            event = event.with_signal("old_path", old.to_string_lossy().to_string());
        }
        if let Some(pid) = pid {
            let name = process_name.unwrap_or_default();
            event = event.with_process(ProcessInfo::new(pid, &name));
        }

        if op == FileOp::Rename {
            let reading = match content_sample {
                Some(bytes) => EntropyReading::from_bytes(&bytes).ok_or_else(|| "empty sample".to_string()),
                None => entropy::sample_file(&path)
                    .map_err(|e| e.to_string())
                    .and_then(|s| EntropyReading::from_samples(&s).ok_or_else(|| "empty file".to_string())),
            };
            event = match reading {
                Ok(r) => event
                    .with_signal("entropy", r.average)
                    .with_signal("entropy_min", r.minimum)
                    .with_signal("entropy_samples", r.samples),
                Err(reason) => event.with_signal("entropy_error", reason),
            };
        }

        Ok(event.with_path(path))
    }

    fn is_quarantine_path(&self, path: &Path) -> bool {
        !self.quarantine_dir.as_os_str().is_empty() && path.starts_with(&self.quarantine_dir)
    }
}
