//! Audit Recorder
//!
//! Append-only JSONL trail of alerts, action results, drops and config
//! reloads. Thread-safe, flushed per record, rotated at 50 MB.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::logic::detection::Alert;
use crate::logic::response::types::ActionResult;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Maximum file size before rotation (50 MB)
const MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;

const LOG_EXT: &str = "jsonl";

// ============================================================================
// RECORDS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum AuditRecord {
    AgentStart {
        version: String,
        host: String,
        at: DateTime<Utc>,
    },
    AgentStop {
        uptime_secs: u64,
        at: DateTime<Utc>,
    },
    Alert {
        alert: Alert,
    },
    Action {
        result: ActionResult,
    },
    /// Alert archived after the retry ceiling; carries the signed payload
    Dropped {
        alert_id: u64,
        attempts: u32,
        reason: String,
        payload: String,
        at: DateTime<Utc>,
    },
    ConfigReload {
        generation: u64,
        accepted: bool,
        detail: String,
        at: DateTime<Utc>,
    },
}

impl AuditRecord {
    pub fn alert_id(&self) -> Option<u64> {
        match self {
            AuditRecord::Alert { alert } => Some(alert.id),
            AuditRecord::Action { result } => Some(result.alert_id),
            AuditRecord::Dropped { alert_id, .. } => Some(*alert_id),
            _ => None,
        }
    }
}

// ============================================================================
// RECORDER STATE
// ============================================================================

static RECORDER: Mutex<Option<Recorder>> = Mutex::new(None);

static RECORDS_WRITTEN: AtomicU64 = AtomicU64::new(0);

// ============================================================================
// RECORDER
// ============================================================================

pub struct Recorder {
    writer: BufWriter<File>,
    current_file: PathBuf,
    current_size: u64,
    base_dir: PathBuf,
    max_size: u64,
}

impl Recorder {
    pub fn new(base_dir: PathBuf) -> std::io::Result<Self> {
        Self::with_max_size(base_dir, MAX_FILE_SIZE)
    }

    pub fn with_max_size(base_dir: PathBuf, max_size: u64) -> std::io::Result<Self> {
        std::fs::create_dir_all(&base_dir)?;
        let (file_path, file, size) = Self::open_file(&base_dir, 0)?;
        Ok(Self {
            writer: BufWriter::new(file),
            current_file: file_path,
            current_size: size,
            base_dir,
            max_size,
        })
    }

    /// File names sort chronologically; `seq` separates rotations within one second
    fn open_file(base_dir: &Path, seq: u32) -> std::io::Result<(PathBuf, File, u64)> {
        let filename = format!("audit_{}_{:03}.{}", Utc::now().format("%Y%m%d_%H%M%S"), seq, LOG_EXT);
        let file_path = base_dir.join(filename);
        let file = OpenOptions::new().create(true).append(true).open(&file_path)?;
        let size = file.metadata()?.len();
        log::info!("[Audit] Opened audit log: {:?}", file_path);
        Ok((file_path, file, size))
    }

    pub fn record(&mut self, record: &AuditRecord) -> std::io::Result<()> {
        let line = serde_json::to_string(record)?;
        let bytes = line.as_bytes();

        if self.current_size > 0 && self.current_size + bytes.len() as u64 + 1 > self.max_size {
            self.rotate()?;
        }

        self.writer.write_all(bytes)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        self.current_size += bytes.len() as u64 + 1;

        RECORDS_WRITTEN.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn rotate(&mut self) -> std::io::Result<()> {
        self.writer.flush()?;
        let mut seq = 1;
        let (new_path, new_file, size) = loop {
            let opened = Self::open_file(&self.base_dir, seq)?;
            if opened.0 != self.current_file || seq > 999 {
                break opened;
            }
            seq += 1;
        };
        log::info!("[Audit] Rotated {:?} -> {:?}", self.current_file, new_path);
        self.writer = BufWriter::new(new_file);
        self.current_file = new_path;
        self.current_size = size;
        Ok(())
    }

    pub fn current_file(&self) -> &Path {
        &self.current_file
    }
}

// ============================================================================
// GLOBAL API
// ============================================================================

pub fn init(base_dir: PathBuf, host: &str) -> std::io::Result<()> {
    let recorder = Recorder::new(base_dir)?;
    *RECORDER.lock() = Some(recorder);
    record(AuditRecord::AgentStart {
        version: crate::constants::APP_VERSION.to_string(),
        host: host.to_string(),
        at: Utc::now(),
    });
    Ok(())
}

/// Write one record; without an initialised recorder the record goes to the log only
pub fn record(record: AuditRecord) {
    let mut guard = RECORDER.lock();
    match guard.as_mut() {
        Some(recorder) => {
            if let Err(e) = recorder.record(&record) {
                log::error!("[Audit] Failed to write record: {}", e);
            }
        }
        None => log::debug!("[Audit] Recorder not initialised: {:?}", record),
    }
}

pub fn records_written() -> u64 {
    RECORDS_WRITTEN.load(Ordering::Relaxed)
}

pub fn current_log_file() -> Option<PathBuf> {
    RECORDER.lock().as_ref().map(|r| r.current_file().to_path_buf())
}

pub fn shutdown(uptime_secs: u64) {
    let mut guard = RECORDER.lock();
    if let Some(mut recorder) = guard.take() {
        let _ = recorder.record(&AuditRecord::AgentStop {
            uptime_secs,
            at: Utc::now(),
        });
        let _ = recorder.writer.flush();
        log::info!("[Audit] Recorder shut down, {} records written", records_written());
    }
}

// ============================================================================
// QUERY API
// ============================================================================

/// Read every parseable record from one file
pub fn read_records(file_path: &Path) -> std::io::Result<Vec<AuditRecord>> {
    let reader = BufReader::new(File::open(file_path)?);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<AuditRecord>(&line) {
            Ok(r) => records.push(r),
            Err(e) => log::warn!("[Audit] Skipping unreadable line in {:?}: {}", file_path, e),
        }
    }
    Ok(records)
}

/// Audit files in `dir`, oldest first
pub fn list_log_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if dir.is_dir() {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().map_or(false, |e| e == LOG_EXT) {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Every record mentioning `alert_id`, across all files in `dir`
pub fn trail_for(dir: &Path, alert_id: u64) -> std::io::Result<Vec<AuditRecord>> {
    let mut trail = Vec::new();
    for file in list_log_files(dir)? {
        trail.extend(
            read_records(&file)?
                .into_iter()
                .filter(|r| r.alert_id() == Some(alert_id)),
        );
    }
    Ok(trail)
}
