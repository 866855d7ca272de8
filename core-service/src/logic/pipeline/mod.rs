//! Pipeline Module - Sensors to Alerts to Responses
//!
//! ```text
//! sensor threads --SensorHandle--> intake queue --> detection worker
//!                                                    |-- auto-contain: playbooks, then outbox
//!                                                    `-- otherwise: outbox + parked row, then response worker
//! notification bus --> republisher --> outbox (follow-up INFO alerts)
//! ```
//!
//! - `worker.rs`: detection worker, response worker, republisher
//! - `tests.rs`: end-to-end scenarios

mod worker;

#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::constants::{INTAKE_QUEUE_CAPACITY, RESPONSE_QUEUE_CAPACITY};
use crate::logic::config::ConfigHandle;
use crate::logic::detection::engine::EngineStats;
use crate::logic::detection::{AlertSequence, DetectionEngine};
use crate::logic::playbook::PlaybookEngine;
use crate::logic::telemetry::event::Event;
use crate::logic::telemetry::normalizer::{NormalizeError, Normalizer, RawSensorEvent};
use crate::logic::transport::AlertSink;

pub use worker::{follow_up_alert, spawn_republisher};

use worker::{AlertRouter, DetectionWorker};

// ============================================================================
// INTAKE
// ============================================================================

#[derive(Debug, Default)]
pub struct IntakeStats {
    pub accepted: AtomicU64,
    pub malformed: AtomicU64,
    pub filtered: AtomicU64,
    pub backpressure: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntakeCounts {
    pub accepted: u64,
    pub malformed: u64,
    pub filtered: u64,
    pub backpressure: u64,
}

impl IntakeStats {
    pub fn snapshot(&self) -> IntakeCounts {
        IntakeCounts {
            accepted: self.accepted.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            backpressure: self.backpressure.load(Ordering::Relaxed),
        }
    }
}

/// Message on the intake queue
pub(crate) enum Intake {
    Event(Event),
    /// Everything queued before this is still evaluated
    Stop,
}

/// What a sensor holds: normalizes on the sensor's own thread and pushes
/// the canonical event onto the single intake queue
#[derive(Clone)]
pub struct SensorHandle {
    tx: SyncSender<Intake>,
    normalizer: Normalizer,
    stats: Arc<IntakeStats>,
}

impl SensorHandle {
    /// False when the record was dropped or the pipeline is shutting down
    pub fn submit(&self, raw: RawSensorEvent) -> bool {
        let event = match self.normalizer.normalize(raw) {
            Ok(event) => event,
            Err(NormalizeError::Filtered(why)) => {
                self.stats.filtered.fetch_add(1, Ordering::Relaxed);
                log::trace!("[Normalizer] Ignored {}", why);
                return false;
            }
            Err(e) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                log::warn!("[Normalizer] Dropped: {}", e);
                return false;
            }
        };

        let sent = match self.tx.try_send(Intake::Event(event)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) => {
                if self.stats.backpressure.fetch_add(1, Ordering::Relaxed) == 0 {
                    log::warn!("[Detection] Intake queue full, sensors are being throttled");
                }
                self.tx.send(event).map_err(|_| ())
            }
            Err(TrySendError::Disconnected(_)) => Err(()),
        };
        match sent {
            Ok(()) => {
                self.stats.accepted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(()) => {
                log::debug!("[Detection] Intake closed, event discarded");
                false
            }
        }
    }

    pub fn stats(&self) -> IntakeCounts {
        self.stats.snapshot()
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

/// Everything the workers share
pub struct PipelineParts {
    pub config: Arc<ConfigHandle>,
    pub ids: Arc<AlertSequence>,
    pub soar: Arc<PlaybookEngine>,
    pub sink: AlertSink,
    pub normalizer: Normalizer,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineReport {
    pub detection: EngineStats,
    pub intake: IntakeCounts,
    pub responses: u64,
}

pub struct Pipeline {
    intake: SensorHandle,
    detection: JoinHandle<EngineStats>,
    response: JoinHandle<u64>,
}

impl Pipeline {
    pub fn start(parts: PipelineParts) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::sync_channel(INTAKE_QUEUE_CAPACITY);
        let (response_tx, response_rx) = mpsc::sync_channel(RESPONSE_QUEUE_CAPACITY);

        let snapshot = parts.config.current();
        let engine = DetectionEngine::new(&snapshot.config.detection, parts.ids.clone());

        let backlog = parts.soar.ledger().deferred_responses().unwrap_or_else(|e| {
            log::error!("[SOAR] Parked alerts unreadable, not replayed: {}", e);
            Vec::new()
        });
        let response = {
            let soar = parts.soar.clone();
            let config = parts.config.clone();
            std::thread::Builder::new()
                .name("soar-response".into())
                .spawn(move || worker::run_response_worker(backlog, response_rx, soar, config))?
        };

        let router = AlertRouter::new(parts.sink, parts.soar, parts.config.clone(), response_tx);
        let worker = DetectionWorker::new(engine, parts.config, snapshot.generation, router);
        let detection = std::thread::Builder::new()
            .name("detection".into())
            .spawn(move || worker.run(rx))?;

        log::info!(
            "[Detection] Pipeline started (intake capacity {}, {} playbook(s))",
            INTAKE_QUEUE_CAPACITY,
            snapshot.playbooks.len()
        );

        Ok(Self {
            intake: SensorHandle {
                tx,
                normalizer: parts.normalizer,
                stats: Arc::new(IntakeStats::default()),
            },
            detection,
            response,
        })
    }

    pub fn sensor_handle(&self) -> SensorHandle {
        self.intake.clone()
    }

    /// Drain and stop. Stop sensors first: records submitted after this
    /// call are discarded.
    pub fn shutdown(self) -> PipelineReport {
        let intake = self.intake.stats();
        if self.intake.tx.send(Intake::Stop).is_err() {
            log::warn!("[Detection] Worker already gone at shutdown");
        }
        drop(self.intake);

        let detection = self.detection.join().unwrap_or_else(|_| {
            log::error!("[Detection] Worker panicked during shutdown");
            EngineStats::default()
        });
        // The detection worker owned the response sender; in-flight actions finish here
        let responses = self.response.join().unwrap_or_else(|_| {
            log::error!("[SOAR] Response worker panicked during shutdown");
            0
        });

        log::info!(
            "[Detection] Pipeline stopped: {} event(s), {} alert(s), {} response run(s)",
            detection.events,
            detection.alerts,
            responses
        );
        PipelineReport {
            detection,
            intake,
            responses,
        }
    }
}
