//! Delivery Loop
//!
//! Drains the outbox oldest-first. A cycle stops at the first alert that
//! is not due or fails, so alerts reach the collector in creation order.
//! Runs on its own thread and runtime; nothing here touches the detection
//! hot path. The same thread runs the hourly store retention sweep.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::RwLock;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{watch, Notify};

use crate::constants::RETENTION_SWEEP_INTERVAL_SECS;
use crate::logic::config::ConfigHandle;
use crate::logic::telemetry::recorder::{self, AuditRecord};

use super::client::Publisher;
use super::outbox::{backoff_ms, Outbox, OutboxEntry};
use super::wire::SignedEnvelope;
use super::TransportError;

/// Rows fetched per cycle
const BATCH: usize = 64;

/// Consecutive 401s before the key is reported as misconfigured
const MISMATCH_ESCALATION: u32 = 3;

/// Operator-visible transport health
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransportStatus {
    pub endpoint: String,
    pub connected: bool,
    pub delivered: u64,
    pub failed_attempts: u64,
    pub dropped: u64,
    pub consecutive_mismatches: u32,
    pub key_misconfigured: bool,
    pub last_error: Option<String>,
    pub last_delivery: Option<chrono::DateTime<Utc>>,
}

pub type SharedStatus = Arc<RwLock<TransportStatus>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub delivered: usize,
    pub failed: usize,
    pub dropped: usize,
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub struct DeliveryWorker<P: Publisher> {
    outbox: Outbox,
    publisher: P,
    config: Arc<ConfigHandle>,
    status: SharedStatus,
    wake: Arc<Notify>,
}

impl<P: Publisher> DeliveryWorker<P> {
    pub fn new(
        outbox: Outbox,
        publisher: P,
        config: Arc<ConfigHandle>,
        wake: Arc<Notify>,
    ) -> Self {
        let status = TransportStatus {
            endpoint: publisher.describe(),
            ..Default::default()
        };
        Self {
            outbox,
            publisher,
            config,
            status: Arc::new(RwLock::new(status)),
            wake,
        }
    }

    pub fn status(&self) -> SharedStatus {
        self.status.clone()
    }

    /// One pass over the head of the queue
    pub async fn run_cycle(&mut self, now: i64) -> Result<CycleReport, TransportError> {
        let mut report = CycleReport::default();
        let snapshot = self.config.current();
        let retry = snapshot.config.outbound.retry.clone();

        for entry in self.outbox.head(now, BATCH)? {
            if entry.next_attempt_ms > now {
                break;
            }

            // Signed at send time so a rotated key applies to queued alerts too
            let body = SignedEnvelope::seal(entry.alert_id, &entry.payload, &snapshot.hmac_key)?
                .to_bytes()?;
            self.outbox.mark_sent(entry.alert_id)?;

            match self.publisher.publish(entry.alert_id, &body).await {
                Ok(()) => {
                    self.outbox.mark_acked(entry.alert_id)?;
                    report.delivered += 1;
                    self.on_delivered(&entry);
                }
                Err(e) => {
                    let delay = jittered(backoff_ms(
                        entry.attempts + 1,
                        retry.base_delay_ms,
                        retry.max_delay_ms,
                    ));
                    let attempts =
                        self.outbox
                            .mark_failed(entry.alert_id, &e.to_string(), now + delay as i64)?;
                    self.on_failed(&entry, &e, attempts, delay);

                    if attempts >= retry.max_retries {
                        self.drop_entry(&entry, attempts, &e)?;
                        report.dropped += 1;
                    } else {
                        report.failed += 1;
                    }
                    break;
                }
            }
        }
        Ok(report)
    }

    fn on_delivered(&self, entry: &OutboxEntry) {
        let mut status = self.status.write();
        status.connected = true;
        status.delivered += 1;
        status.consecutive_mismatches = 0;
        status.last_delivery = Some(Utc::now());
        if status.key_misconfigured {
            log::info!("[Transport] Signature accepted again, key misconfiguration cleared");
            status.key_misconfigured = false;
        }
        log::info!(
            "[Transport] Alert #{} ACKED after {} failed attempt(s)",
            entry.alert_id,
            entry.attempts
        );
    }

    fn on_failed(&self, entry: &OutboxEntry, error: &TransportError, attempts: u32, delay_ms: u64) {
        let mut status = self.status.write();
        status.failed_attempts += 1;
        status.last_error = Some(error.to_string());

        match error {
            TransportError::SignatureMismatch => {
                // The collector answered, so the link is up
                status.connected = true;
                status.consecutive_mismatches += 1;
                if status.consecutive_mismatches >= MISMATCH_ESCALATION && !status.key_misconfigured {
                    status.key_misconfigured = true;
                    log::error!(
                        "[Transport] {} consecutive signature rejections: HMAC key is likely misconfigured, operator action required",
                        status.consecutive_mismatches
                    );
                }
            }
            TransportError::Rejected(..) => status.connected = true,
            _ => status.connected = false,
        }

        log::warn!(
            "[Transport] Alert #{} FAILED (attempt {}): {}; retry in {} ms",
            entry.alert_id,
            attempts,
            error,
            delay_ms
        );
    }

    fn drop_entry(
        &self,
        entry: &OutboxEntry,
        attempts: u32,
        error: &TransportError,
    ) -> Result<(), TransportError> {
        let reason = format!("max retries ({}) reached, last error: {}", attempts, error);
        self.outbox.mark_dropped(entry.alert_id, &reason)?;
        self.status.write().dropped += 1;
        log::error!("[Transport] Alert #{} DROPPED: {}", entry.alert_id, reason);
        recorder::record(AuditRecord::Dropped {
            alert_id: entry.alert_id,
            attempts,
            reason,
            payload: String::from_utf8_lossy(&entry.payload).to_string(),
            at: Utc::now(),
        });
        Ok(())
    }

    /// Loop until `shutdown` flips; a final pass runs before returning
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        match self.outbox.recover() {
            Ok(n) if n > 0 => log::info!("[Transport] {} in-flight alert(s) back to PENDING", n),
            Ok(_) => {}
            Err(e) => log::error!("[Transport] Outbox recovery failed: {}", e),
        }
        log::info!("[Transport] Delivery loop started ({})", self.publisher.describe());

        let sweep_every = Duration::from_secs(RETENTION_SWEEP_INTERVAL_SECS);
        let mut last_sweep = Instant::now();
        loop {
            if let Err(e) = self.run_cycle(now_ms()).await {
                log::error!("[Transport] Delivery cycle error: {}", e);
            }
            if last_sweep.elapsed() >= sweep_every {
                let days = self.config.current().config.storage.retention_days;
                if let Err(e) = self.outbox.store().sweep_older_than(days) {
                    log::warn!("[Store] Retention sweep failed: {}", e);
                }
                last_sweep = Instant::now();
            }
            if *shutdown.borrow() {
                break;
            }

            let poll_ms = self.config.current().config.outbound.retry.poll_interval_ms;
            let poll = Duration::from_millis(poll_ms.max(10));
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = self.wake.notified() => {}
                _ = shutdown.changed() => {}
            }
        }

        if let Err(e) = self.outbox.store().checkpoint() {
            log::error!("[Transport] Final checkpoint failed: {}", e);
        }
        match self.outbox.counts() {
            Ok(c) => log::info!(
                "[Transport] Delivery loop stopped, {} alert(s) still queued on disk",
                c.undelivered()
            ),
            Err(e) => log::warn!("[Transport] Delivery loop stopped: {}", e),
        }
    }
}

/// +/-20% so many agents do not retry in lockstep
fn jittered(delay_ms: u64) -> u64 {
    let spread = delay_ms / 5;
    if spread == 0 {
        return delay_ms;
    }
    let offset = rand::thread_rng().gen_range(0..=spread * 2);
    delay_ms - spread + offset
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..100 {
            let d = jittered(1_000);
            assert!((800..=1_200).contains(&d));
        }
        assert_eq!(jittered(3), 3);
    }
}
