//! Sensors Module - Built-in Telemetry Sources
//!
//! Each sensor runs on its own thread and only talks to the pipeline
//! through a `SensorHandle`, so a slow or failing sensor never stalls
//! detection.
//!
//! - `file.rs`: file-system watcher over `watch_paths` (notify)
//! - `process.rs`: process-start poller (sysinfo pid diff)
//! - `resource.rs`: per-process CPU / disk-write monitor (sysinfo)
//! - `feed.rs`: JSON-lines reader for external log readers

pub mod feed;
pub mod file;
pub mod process;
pub mod resource;

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::logic::config::ConfigHandle;
use crate::logic::pipeline::SensorHandle;

// ============================================================================
// STOP SIGNAL
// ============================================================================

/// Interruptible sleep shared by all sensor threads
#[derive(Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    cv: Condvar,
}

impl StopSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn stop(&self) {
        *self.stopped.lock() = true;
        self.cv.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }

    /// Sleep up to `timeout`; true once stop was requested
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            self.cv.wait_for(&mut stopped, timeout);
        }
        *stopped
    }
}

// ============================================================================
// SENSOR SET
// ============================================================================

pub struct SensorSet {
    stop: Arc<StopSignal>,
    threads: Vec<JoinHandle<()>>,
}

impl SensorSet {
    /// Start every built-in sensor. One that fails to start is logged and
    /// skipped; the others keep running.
    pub fn start(handle: &SensorHandle, config: &Arc<ConfigHandle>) -> Self {
        let mut set = Self {
            stop: StopSignal::new(),
            threads: Vec::new(),
        };

        set.track("file", file::spawn(handle.clone(), config.clone(), set.stop.clone()));
        set.track(
            "process",
            process::spawn(handle.clone(), config.clone(), set.stop.clone()),
        );
        set.track(
            "resource",
            resource::spawn(handle.clone(), config.clone(), set.stop.clone()),
        );
        set
    }

    fn track(&mut self, name: &str, spawned: std::io::Result<JoinHandle<()>>) {
        match spawned {
            Ok(thread) => {
                log::info!("[Sensors] {} sensor started", name);
                self.threads.push(thread);
            }
            Err(e) => log::error!("[Sensors] {} sensor failed to start: {}", name, e),
        }
    }

    pub fn stop_signal(&self) -> Arc<StopSignal> {
        self.stop.clone()
    }

    pub fn running(&self) -> usize {
        self.threads.iter().filter(|t| !t.is_finished()).count()
    }

    /// Signal and join every sensor thread
    pub fn stop(self) {
        self.stop.stop();
        for thread in self.threads {
            if thread.join().is_err() {
                log::error!("[Sensors] A sensor thread panicked");
            }
        }
        log::info!("[Sensors] All sensors stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_stop_interrupts_wait() {
        let signal = StopSignal::new();
        let waiter = {
            let signal = signal.clone();
            std::thread::spawn(move || {
                let started = Instant::now();
                let stopped = signal.wait(Duration::from_secs(30));
                (stopped, started.elapsed())
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        signal.stop();
        let (stopped, waited) = waiter.join().unwrap();
        assert!(stopped);
        assert!(waited < Duration::from_secs(30));
        assert!(signal.wait(Duration::from_secs(30)));
    }

    #[test]
    fn test_wait_times_out_without_stop() {
        let signal = StopSignal::new();
        assert!(!signal.wait(Duration::from_millis(5)));
        assert!(!signal.is_stopped());
    }
}
