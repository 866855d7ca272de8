//! Pipeline workers
//!
//! The detection worker is the only owner of `DetectionEngine`, so burst
//! windows are mutated without locks. Network I/O never happens here: the
//! outbox write is a local SQLite insert.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use crate::constants::WORKER_TICK_MS;
use crate::logic::config::ConfigHandle;
use crate::logic::detection::engine::EngineStats;
use crate::logic::detection::{Alert, AlertSequence, DetectionEngine, Finding, Severity};
use crate::logic::events::NotificationBus;
use crate::logic::playbook::{Ledger, Playbook, PlaybookEngine};
use crate::logic::response::types::Notification;
use crate::logic::telemetry::event::{mono_now_ns, Event, EventKind};
use crate::logic::telemetry::recorder::{self, AuditRecord};
use crate::logic::transport::AlertSink;

use super::Intake;

// ============================================================================
// ROUTING
// ============================================================================

pub(crate) struct AlertRouter {
    sink: AlertSink,
    soar: Arc<PlaybookEngine>,
    config: Arc<ConfigHandle>,
    response_tx: SyncSender<Alert>,
}

impl AlertRouter {
    pub(crate) fn new(
        sink: AlertSink,
        soar: Arc<PlaybookEngine>,
        config: Arc<ConfigHandle>,
        response_tx: SyncSender<Alert>,
    ) -> Self {
        Self {
            sink,
            soar,
            config,
            response_tx,
        }
    }

    fn route(&self, alert: Alert) {
        recorder::record(AuditRecord::Alert {
            alert: alert.clone(),
        });

        if alert.auto_contain {
            log::warn!(
                "[SOAR] Alert #{} is auto-containment eligible, responding before transport",
                alert.id
            );
            self.soar.handle(&alert, &self.config.current().playbooks);
            self.submit(&alert);
            return;
        }

        // Parked durably with the outbox row; a crash before the response
        // worker finishes replays it on the next start
        if let Err(e) = self.sink.submit_with(&alert, |conn| Ledger::defer_response(conn, &alert)) {
            log::error!("[Transport] Alert #{} could not be queued: {}", alert.id, e);
        }
        if let Err(e) = self.response_tx.send(alert) {
            let alert = e.0;
            log::warn!("[SOAR] Response worker gone, handling alert #{} inline", alert.id);
            respond(&self.soar, &alert, &self.config.current().playbooks);
        }
    }

    fn submit(&self, alert: &Alert) {
        if let Err(e) = self.sink.submit(alert) {
            log::error!("[Transport] Alert #{} could not be queued: {}", alert.id, e);
        }
    }
}

// ============================================================================
// DETECTION WORKER
// ============================================================================

pub(crate) struct DetectionWorker {
    engine: DetectionEngine,
    config: Arc<ConfigHandle>,
    generation: u64,
    router: AlertRouter,
}

impl DetectionWorker {
    pub(crate) fn new(
        engine: DetectionEngine,
        config: Arc<ConfigHandle>,
        generation: u64,
        router: AlertRouter,
    ) -> Self {
        Self {
            engine,
            config,
            generation,
            router,
        }
    }

    /// Pick up a reloaded config between events
    fn checkpoint(&mut self) {
        let snapshot = self.config.current();
        if snapshot.generation != self.generation {
            self.engine.apply_config(&snapshot.config.detection);
            self.generation = snapshot.generation;
        }
    }

    fn dispatch(&self, alerts: Vec<Alert>) {
        for alert in alerts {
            self.router.route(alert);
        }
    }

    /// Runs until `Intake::Stop` or every sender is gone, then closes open windows
    pub(crate) fn run(mut self, rx: Receiver<Intake>) -> EngineStats {
        let tick = Duration::from_millis(WORKER_TICK_MS);
        let mut last_flush = Instant::now();
        log::info!("[Detection] Worker started");

        loop {
            match rx.recv_timeout(tick) {
                Ok(Intake::Event(event)) => {
                    self.checkpoint();
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                        let alerts = self.engine.evaluate(&event);
                        self.dispatch(alerts);
                    }));
                    if outcome.is_err() {
                        log::error!(
                            "[Detection] Panic while handling {} event, skipped",
                            event.kind.as_str()
                        );
                    }
                }
                Ok(Intake::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }

            if last_flush.elapsed() >= tick {
                let alerts = self.engine.flush(mono_now_ns());
                self.dispatch(alerts);
                last_flush = Instant::now();
            }
        }

        let alerts = self.engine.drain();
        if !alerts.is_empty() {
            log::info!("[Detection] Closing {} open burst window(s)", alerts.len());
        }
        self.dispatch(alerts);
        self.engine.stats()
    }
}

// ============================================================================
// RESPONSE WORKER
// ============================================================================

/// Run playbooks for a parked alert, then release it
fn respond(soar: &PlaybookEngine, alert: &Alert, playbooks: &[Playbook]) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| soar.handle(alert, playbooks)));
    if outcome.is_err() {
        log::error!("[SOAR] Panic while responding to alert #{}", alert.id);
    }
    if let Err(e) = soar.ledger().clear_deferred(alert.id) {
        log::error!("[SOAR] Alert #{} stays parked for replay: {}", alert.id, e);
    }
}

/// Runs playbooks for non-urgent alerts in arrival order, starting with
/// alerts left parked by a previous run
pub(crate) fn run_response_worker(
    backlog: Vec<Alert>,
    rx: Receiver<Alert>,
    soar: Arc<PlaybookEngine>,
    config: Arc<ConfigHandle>,
) -> u64 {
    let mut handled = 0;
    if !backlog.is_empty() {
        log::info!("[SOAR] Replaying {} alert(s) parked before the last shutdown", backlog.len());
    }
    for alert in backlog.into_iter().chain(rx.iter()) {
        let playbooks = config.current().playbooks.clone();
        respond(&soar, &alert, &playbooks);
        handled += 1;
    }
    handled
}

// ============================================================================
// NOTIFICATION REPUBLISHER
// ============================================================================

/// INFO alert carrying a playbook notification to the collector
pub fn follow_up_alert(notification: &Notification, id: u64) -> Alert {
    let event = Event::new(EventKind::Log, "playbook_notification", &notification.host);
    let finding = Finding::new(
        Severity::Info,
        10,
        "playbook_notification",
        format!("{}: {}", notification.title, notification.message),
    )
    .indicator("follow_up")
    .signal("source_alert_id", notification.alert_id)
    .signal("source_severity", notification.severity.as_str())
    .signal("playbook", notification.playbook.clone());
    Alert::from_finding(id, event.summary(), finding)
}

/// Re-publish notifications through transport while `notify_republish` is on
pub fn spawn_republisher(
    bus: &NotificationBus,
    sink: AlertSink,
    ids: Arc<AlertSequence>,
    config: Arc<ConfigHandle>,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    let mut rx = bus.subscribe();
    std::thread::Builder::new()
        .name("notify-republish".into())
        .spawn(move || loop {
            match rx.blocking_recv() {
                Ok(n) => {
                    if !config.current().config.response.notify_republish {
                        continue;
                    }
                    let alert = follow_up_alert(&n, ids.next_id());
                    recorder::record(AuditRecord::Alert {
                        alert: alert.clone(),
                    });
                    match sink.submit(&alert) {
                        Ok(_) => log::info!(
                            "[Notify] Alert #{} republished as follow-up alert #{}",
                            n.alert_id,
                            alert.id
                        ),
                        Err(e) => log::error!("[Notify] Follow-up for alert #{} lost: {}", n.alert_id, e),
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("[Notify] Republisher lagged, {} notifications skipped", skipped)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        })
}
