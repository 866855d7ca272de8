//! File-system sensor
//!
//! One recursive notify watcher over the configured watch paths. The
//! watch set follows config reloads.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use notify::event::{ModifyKind, RenameMode};
use notify::{Event as FsEvent, EventKind as FsKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::logic::config::ConfigHandle;
use crate::logic::pipeline::SensorHandle;
use crate::logic::telemetry::normalizer::{FileOp, RawSensorEvent};

use super::StopSignal;

/// How often the watch set is compared with the current config
const RESYNC_INTERVAL: Duration = Duration::from_secs(1);

/// Turns notify events into raw records. Pairs split renames (Windows
/// reports the source and the destination as two events).
#[derive(Default)]
pub struct Translator {
    pending_from: Option<PathBuf>,
}

impl Translator {
    pub fn translate(&mut self, event: &FsEvent) -> Vec<RawSensorEvent> {
        let record = |op: FileOp, path: &PathBuf, old_path: Option<PathBuf>| RawSensorEvent::FileSystem {
            op,
            path: path.clone(),
            old_path,
            content_sample: None,
            pid: None,
            process_name: None,
        };

        match &event.kind {
            FsKind::Create(_) => event.paths.iter().map(|p| record(FileOp::Create, p, None)).collect(),
            FsKind::Remove(_) => event.paths.iter().map(|p| record(FileOp::Delete, p, None)).collect(),
            FsKind::Modify(ModifyKind::Name(RenameMode::Both)) => match event.paths.as_slice() {
                [from, to] => vec![record(FileOp::Rename, to, Some(from.clone()))],
                _ => Vec::new(),
            },
            FsKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                self.pending_from = event.paths.first().cloned();
                Vec::new()
            }
            FsKind::Modify(ModifyKind::Name(_)) => {
                let Some(to) = event.paths.last() else {
                    return Vec::new();
                };
                match self.pending_from.take() {
                    Some(from) => vec![record(FileOp::Rename, to, Some(from))],
                    // Moved in from outside the watched tree
                    None => vec![record(FileOp::Create, to, None)],
                }
            }
            FsKind::Modify(ModifyKind::Metadata(_)) | FsKind::Access(_) => Vec::new(),
            FsKind::Modify(_) => event.paths.iter().map(|p| record(FileOp::Modify, p, None)).collect(),
            _ => Vec::new(),
        }
    }
}

pub struct FileSensor {
    watcher: RecommendedWatcher,
    watched: BTreeSet<PathBuf>,
}

impl FileSensor {
    pub fn new(handle: SensorHandle) -> notify::Result<Self> {
        let mut translator = Translator::default();
        let watcher = notify::recommended_watcher(move |res: notify::Result<FsEvent>| match res {
            Ok(event) => {
                for raw in translator.translate(&event) {
                    handle.submit(raw);
                }
            }
            Err(e) => log::warn!("[Sensors] File watcher error: {}", e),
        })?;
        Ok(Self {
            watcher,
            watched: BTreeSet::new(),
        })
    }

    /// Bring the watch set in line with `paths`; missing directories are
    /// skipped and retried on the next sync
    pub fn sync(&mut self, paths: &[PathBuf]) {
        let wanted: BTreeSet<PathBuf> = paths.iter().cloned().collect();

        for gone in self.watched.difference(&wanted).cloned().collect::<Vec<_>>() {
            if let Err(e) = self.watcher.unwatch(&gone) {
                log::debug!("[Sensors] unwatch {:?}: {}", gone, e);
            }
            self.watched.remove(&gone);
            log::info!("[Sensors] No longer watching {:?}", gone);
        }

        for path in wanted.difference(&self.watched).cloned().collect::<Vec<_>>() {
            if !path.exists() {
                continue;
            }
            match self.watcher.watch(&path, RecursiveMode::Recursive) {
                Ok(()) => {
                    log::info!("[Sensors] Watching {:?}", path);
                    self.watched.insert(path);
                }
                Err(e) => log::warn!("[Sensors] Cannot watch {:?}: {}", path, e),
            }
        }
    }

    pub fn watched(&self) -> &BTreeSet<PathBuf> {
        &self.watched
    }
}

pub fn spawn(
    handle: SensorHandle,
    config: Arc<ConfigHandle>,
    stop: Arc<StopSignal>,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("sensor-file".into())
        .spawn(move || {
            let mut sensor = match FileSensor::new(handle) {
                Ok(s) => s,
                Err(e) => {
                    log::error!("[Sensors] File watcher unavailable: {}", e);
                    return;
                }
            };
            let mut generation = None;
            loop {
                let snapshot = config.current();
                let missing = snapshot.config.detection.watch_paths.len() > sensor.watched().len();
                if generation != Some(snapshot.generation) || missing {
                    sensor.sync(&snapshot.config.detection.watch_paths);
                    generation = Some(snapshot.generation);
                }
                if stop.wait(RESYNC_INTERVAL) {
                    break;
                }
            }
        })
}
