//! Configuration Module
//!
//! `ConfigHandle` owns the active `Arc<ConfigSnapshot>`. A reload builds a
//! complete new snapshot off to the side and swaps the pointer; readers see
//! either the old or the new generation, never a mix. An invalid reload is
//! rejected and the previous snapshot stays active.
//!
//! The reload signal is a write to the config file, observed by `notify`.

pub mod loader;
pub mod types;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;

use crate::logic::telemetry::recorder::{self, AuditRecord};

pub use loader::{build_snapshot, load_snapshot, ConfigError, ConfigSnapshot};
pub use types::AgentConfig;

/// Quiet period after the last file event before reloading
const RELOAD_DEBOUNCE_MS: u64 = 500;

pub struct ConfigHandle {
    current: RwLock<Arc<ConfigSnapshot>>,
    generation: AtomicU64,
    path: Option<PathBuf>,
}

impl ConfigHandle {
    /// Initial load; failure here is fatal to startup
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let snapshot = load_snapshot(path, 1)?;
        log::info!(
            "[Config] Loaded {:?}: {} watch path(s), {} playbook(s), outbound {:?}",
            path,
            snapshot.config.detection.watch_paths.len(),
            snapshot.playbooks.len(),
            snapshot.config.outbound.mode
        );
        Ok(Self {
            current: RwLock::new(Arc::new(snapshot)),
            generation: AtomicU64::new(1),
            path: Some(path.to_path_buf()),
        })
    }

    /// Handle around a prebuilt snapshot, without a backing file
    pub fn from_snapshot(snapshot: ConfigSnapshot) -> Self {
        let generation = snapshot.generation;
        Self {
            current: RwLock::new(Arc::new(snapshot)),
            generation: AtomicU64::new(generation),
            path: None,
        }
    }

    pub fn current(&self) -> Arc<ConfigSnapshot> {
        self.current.read().clone()
    }

    /// Cheap checkpoint test for workers
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Install `snapshot` as the next generation
    pub fn swap(&self, mut snapshot: ConfigSnapshot) -> u64 {
        let mut current = self.current.write();
        let next = self.generation.load(Ordering::Acquire) + 1;
        snapshot.generation = next;
        *current = Arc::new(snapshot);
        self.generation.store(next, Ordering::Release);
        next
    }

    /// Re-read the backing file; keeps the old snapshot on any error
    pub fn reload(&self) -> Result<u64, ConfigError> {
        let path = self
            .path
            .clone()
            .ok_or_else(|| ConfigError::Invalid("no config file to reload from".into()))?;
        let attempted = self.generation() + 1;

        match load_snapshot(&path, attempted) {
            Ok(snapshot) => {
                let playbooks = snapshot.playbooks.len();
                let generation = self.swap(snapshot);
                log::info!(
                    "[Config] Reloaded generation {} ({} playbook(s))",
                    generation,
                    playbooks
                );
                recorder::record(AuditRecord::ConfigReload {
                    generation,
                    accepted: true,
                    detail: format!("{} playbook(s)", playbooks),
                    at: Utc::now(),
                });
                Ok(generation)
            }
            Err(e) => {
                log::error!(
                    "[Config] Reload rejected, keeping generation {}: {}",
                    self.generation(),
                    e
                );
                recorder::record(AuditRecord::ConfigReload {
                    generation: self.generation(),
                    accepted: false,
                    detail: e.to_string(),
                    at: Utc::now(),
                });
                Err(e)
            }
        }
    }
}

// ============================================================================
// RELOAD WATCHER
// ============================================================================

/// Keeps the file watcher alive; dropping it stops reloads
pub struct ReloadWatcher {
    _watcher: RecommendedWatcher,
}

fn touches(event: &Event, file_name: &std::ffi::OsStr) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any
    ) && event
        .paths
        .iter()
        .any(|p| p.file_name() == Some(file_name))
}

/// Watch the config file's directory (editors replace files) and reload on change
pub fn spawn_reload_watcher(handle: Arc<ConfigHandle>) -> Result<ReloadWatcher, ConfigError> {
    let path = handle
        .path()
        .map(Path::to_path_buf)
        .ok_or_else(|| ConfigError::Watch("handle has no backing file".into()))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .ok_or_else(|| ConfigError::Watch(format!("{:?} has no file name", path)))?;
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let (tx, rx) = mpsc::channel::<()>();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) if touches(&event, &file_name) => {
            let _ = tx.send(());
        }
        Ok(_) => {}
        Err(e) => log::warn!("[Config] Watcher error: {}", e),
    })
    .map_err(|e| ConfigError::Watch(e.to_string()))?;
    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .map_err(|e| ConfigError::Watch(e.to_string()))?;

    std::thread::Builder::new()
        .name("config-reload".into())
        .spawn(move || {
            // Ends when the watcher (and with it the sender) is dropped
            while rx.recv().is_ok() {
                while rx
                    .recv_timeout(Duration::from_millis(RELOAD_DEBOUNCE_MS))
                    .is_ok()
                {}
                let _ = handle.reload();
            }
        })
        .map_err(|e| ConfigError::Watch(e.to_string()))?;

    log::info!("[Config] Watching {:?} for reload", path);
    Ok(ReloadWatcher { _watcher: watcher })
}
