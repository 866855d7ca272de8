//! File Quarantine
//!
//! Moves suspicious files into a dedicated folder under the user's profile
//! (`~/RansomwareQuarantine` by default) and keeps enough metadata to
//! restore them or hand them to forensics.
//!
//! A file that cannot be read or moved is reported as `IoError`: a target
//! locked by the encrypting process is itself evidence.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::Utc;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::types::{ActionError, QuarantineEntry};

// ============================================================================
// CONSTANTS
// ============================================================================

const METADATA_FILE: &str = "quarantine_metadata.json";
const QUARANTINE_EXT: &str = "quarantine";

// ============================================================================
// QUARANTINE MANAGER
// ============================================================================

pub struct QuarantineManager {
    entries: HashMap<String, QuarantineEntry>,
    quarantine_dir: PathBuf,
    total_size: u64,
}

impl QuarantineManager {
    pub fn new(quarantine_dir: PathBuf) -> Result<Self, ActionError> {
        fs::create_dir_all(&quarantine_dir)
            .map_err(|e| ActionError::from_io("create quarantine dir", &e))?;

        let mut manager = Self {
            entries: HashMap::new(),
            quarantine_dir,
            total_size: 0,
        };
        manager.load_metadata();
        Ok(manager)
    }

    pub fn dir(&self) -> &Path {
        &self.quarantine_dir
    }

    /// Move `path` into quarantine
    pub fn quarantine(
        &mut self,
        path: &Path,
        reason: &str,
        alert_id: Option<u64>,
    ) -> Result<QuarantineEntry, ActionError> {
        if path.starts_with(&self.quarantine_dir) {
            return Err(ActionError::InvalidTarget(format!(
                "{} is already inside quarantine",
                path.display()
            )));
        }

        let metadata = fs::symlink_metadata(path).map_err(|e| ActionError::from_io("stat", &e))?;
        if !metadata.is_file() {
            return Err(ActionError::InvalidTarget(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        // Reading the whole file first surfaces locks held by the encrypting process
        let sha256 = calculate_file_hash(path)?;
        let file_size = metadata.len();
        let modified_time = metadata
            .modified()
            .ok()
            .map(|t| chrono::DateTime::<Utc>::from(t).timestamp());

        let id = Uuid::new_v4().to_string();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let quarantine_path = self.quarantine_dir.join(format!("{}.{}", id, QUARANTINE_EXT));

        move_file(path, &quarantine_path)?;

        let entry = QuarantineEntry {
            id: id.clone(),
            original_path: path.to_path_buf(),
            quarantine_path: quarantine_path.clone(),
            file_name,
            file_size,
            sha256,
            modified_time,
            quarantine_time: Utc::now().timestamp(),
            reason: reason.to_string(),
            alert_id,
            can_restore: true,
        };

        self.entries.insert(id, entry.clone());
        self.total_size += file_size;
        self.save_metadata();

        log::warn!(
            "[SOAR] Quarantined {} -> {}",
            path.display(),
            quarantine_path.display()
        );
        Ok(entry)
    }

    /// Move a quarantined file back; uses a `_restored` sibling when the original path is taken
    pub fn restore(&mut self, quarantine_id: &str) -> Result<PathBuf, ActionError> {
        let entry = self
            .entries
            .get(quarantine_id)
            .cloned()
            .ok_or_else(|| ActionError::NotFound(format!("quarantine entry {}", quarantine_id)))?;

        if !entry.can_restore {
            return Err(ActionError::InvalidTarget(format!(
                "{} is marked non-restorable",
                quarantine_id
            )));
        }
        if !entry.quarantine_path.exists() {
            return Err(ActionError::NotFound(
                entry.quarantine_path.to_string_lossy().to_string(),
            ));
        }

        let restore_path = if entry.original_path.exists() {
            let mut new_path = entry.original_path.clone();
            let stem = new_path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "file".to_string());
            let ext = new_path
                .extension()
                .map(|s| format!(".{}", s.to_string_lossy()))
                .unwrap_or_default();
            new_path.set_file_name(format!("{}_restored{}", stem, ext));
            new_path
        } else {
            entry.original_path.clone()
        };

        if let Some(parent) = restore_path.parent() {
            fs::create_dir_all(parent).map_err(|e| ActionError::from_io("create parent", &e))?;
        }
        move_file(&entry.quarantine_path, &restore_path)?;

        self.total_size = self.total_size.saturating_sub(entry.file_size);
        self.entries.remove(quarantine_id);
        self.save_metadata();

        log::info!(
            "[SOAR] Restored {} -> {}",
            entry.quarantine_path.display(),
            restore_path.display()
        );
        Ok(restore_path)
    }

    /// Entries, oldest first
    pub fn list(&self) -> Vec<QuarantineEntry> {
        let mut entries: Vec<_> = self.entries.values().cloned().collect();
        entries.sort_by_key(|e| e.quarantine_time);
        entries
    }

    pub fn get(&self, id: &str) -> Option<QuarantineEntry> {
        self.entries.get(id).cloned()
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    fn load_metadata(&mut self) {
        let metadata_path = self.quarantine_dir.join(METADATA_FILE);

        if let Ok(content) = fs::read_to_string(&metadata_path) {
            match serde_json::from_str::<Vec<QuarantineEntry>>(&content) {
                Ok(entries) => {
                    for entry in entries {
                        if entry.quarantine_path.exists() {
                            self.total_size += entry.file_size;
                            self.entries.insert(entry.id.clone(), entry);
                        }
                    }
                }
                Err(e) => log::error!("[SOAR] Quarantine metadata unreadable: {}", e),
            }
        }
    }

    /// Write-then-rename so a crash never leaves half a metadata file
    fn save_metadata(&self) {
        let metadata_path = self.quarantine_dir.join(METADATA_FILE);
        let tmp_path = self.quarantine_dir.join(format!("{}.tmp", METADATA_FILE));

        let result = serde_json::to_string_pretty(&self.list())
            .map_err(std::io::Error::from)
            .and_then(|json| fs::write(&tmp_path, json))
            .and_then(|_| fs::rename(&tmp_path, &metadata_path));
        if let Err(e) = result {
            log::error!("[SOAR] Failed to persist quarantine metadata: {}", e);
        }
    }
}

// ============================================================================
// UTILITIES
// ============================================================================

/// Rename, or copy + rename + delete across devices
fn move_file(from: &Path, to: &Path) -> Result<(), ActionError> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ActionError::from_io("move", &e)),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            Err(ActionError::IoError(format!("move {}: {}", from.display(), e)))
        }
        Err(_) => {
            let partial = to.with_extension("partial");
            fs::copy(from, &partial)
                .and_then(|_| fs::rename(&partial, to))
                .map_err(|e| {
                    let _ = fs::remove_file(&partial);
                    ActionError::IoError(format!("copy {}: {}", from.display(), e))
                })?;
            if let Err(e) = fs::remove_file(from) {
                // Original still in place; do not leave a second copy behind
                let _ = fs::remove_file(to);
                return Err(ActionError::IoError(format!(
                    "remove original {}: {}",
                    from.display(),
                    e
                )));
            }
            Ok(())
        }
    }
}

fn calculate_file_hash(path: &Path) -> Result<String, ActionError> {
    let mut file = fs::File::open(path)
        .map_err(|e| ActionError::IoError(format!("open {}: {}", path.display(), e)))?;

    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| ActionError::IoError(format!("read {}: {}", path.display(), e)))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}
