//! Delivery scenarios against an in-process collector double.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::client::Publisher;
use super::outbox::{Outbox, OutboxState};
use super::sync::{CycleReport, DeliveryWorker};
use super::wire::{SignedEnvelope, WirePayload};
use super::{AlertSink, TransportError};
use crate::logic::config::types::{AgentConfig, OutboundMode};
use crate::logic::config::{build_snapshot, ConfigHandle};
use crate::logic::detection::{Alert, Finding, Severity};
use crate::logic::store::Store;
use crate::logic::telemetry::event::{Event, EventKind};

const KEY: &[u8] = b"shared-secret";

/// Verifies like the real collector, dedupes by id, can be taken offline
#[derive(Default)]
struct CollectorDouble {
    key: Vec<u8>,
    offline_attempts: usize,
    lose_next_ack: bool,
    received: Arc<Mutex<Vec<u64>>>,
    seen: BTreeSet<u64>,
}

impl CollectorDouble {
    fn new(key: &[u8]) -> Self {
        Self {
            key: key.to_vec(),
            ..Default::default()
        }
    }
}

impl Publisher for CollectorDouble {
    async fn publish(&mut self, alert_id: u64, body: &[u8]) -> Result<(), TransportError> {
        if self.offline_attempts > 0 {
            self.offline_attempts -= 1;
            return Err(TransportError::Failure("connection refused".into()));
        }
        let envelope: SignedEnvelope = serde_json::from_slice(body).unwrap();
        let payload = envelope.open(&self.key)?;
        let wire: WirePayload = serde_json::from_slice(&payload).unwrap();
        assert_eq!(wire.id, alert_id);

        if self.seen.insert(wire.id) {
            self.received.lock().push(wire.id);
        }
        if self.lose_next_ack {
            self.lose_next_ack = false;
            return Err(TransportError::Failure("ack lost".into()));
        }
        Ok(())
    }

    fn describe(&self) -> String {
        "collector-double".into()
    }
}

fn handle(max_retries: u32) -> Arc<ConfigHandle> {
    let mut config = AgentConfig::default();
    config.detection.watch_paths = vec![PathBuf::from("/srv/share")];
    config.outbound.mode = OutboundMode::Https;
    config.outbound.https.url = "https://collector.test/api/v1/ingest".into();
    config.outbound.retry.max_retries = max_retries;
    let snapshot = build_snapshot(config, None, KEY.to_vec(), 1).unwrap();
    Arc::new(ConfigHandle::from_snapshot(snapshot))
}

fn alert(id: u64) -> Alert {
    let event = Event::new(EventKind::File, "create", "host-1");
    Alert::from_finding(
        id,
        event.summary(),
        Finding::new(Severity::Warning, 60, "file_burst", "burst".into()),
    )
}

type Harness = (Outbox, AlertSink, DeliveryWorker<CollectorDouble>);

fn setup(max_retries: u32, collector: CollectorDouble) -> Harness {
    let outbox = Outbox::new(Arc::new(Store::open_in_memory().unwrap()));
    let wake = Arc::new(Notify::new());
    let sink = AlertSink::new(outbox.clone(), "ws-1", wake.clone());
    let worker = DeliveryWorker::new(outbox.clone(), collector, handle(max_retries), wake);
    (outbox, sink, worker)
}

/// Far enough apart that every backoff has expired
const CYCLE_GAP_MS: i64 = 10 * 60 * 1000;

#[tokio::test]
async fn test_scenario_offline_three_cycles_then_reconnect() {
    let mut collector = CollectorDouble::new(KEY);
    collector.offline_attempts = 3;
    let received = collector.received.clone();
    let (outbox, sink, mut worker) = setup(20, collector);

    for id in 1..=5 {
        assert!(sink.submit(&alert(id)).unwrap());
    }

    let mut now = 0;
    for _ in 0..3 {
        now += CYCLE_GAP_MS;
        let report = worker.run_cycle(now).await.unwrap();
        assert_eq!(report.delivered, 0);
        assert_eq!(report.failed, 1);
    }
    assert!(!worker.status().read().connected);

    now += CYCLE_GAP_MS;
    let report = worker.run_cycle(now).await.unwrap();
    assert_eq!(report.delivered, 5);

    assert_eq!(*received.lock(), vec![1, 2, 3, 4, 5]);
    assert_eq!(outbox.counts().unwrap().undelivered(), 0);
    let status = worker.status().read().clone();
    assert!(status.connected);
    assert_eq!(status.delivered, 5);
    assert_eq!(status.failed_attempts, 3);
}

#[tokio::test]
async fn test_backoff_holds_the_queue_head() {
    let mut collector = CollectorDouble::new(KEY);
    collector.offline_attempts = 1;
    let received = collector.received.clone();
    let (_outbox, sink, mut worker) = setup(20, collector);
    sink.submit(&alert(1)).unwrap();
    sink.submit(&alert(2)).unwrap();

    worker.run_cycle(1_000).await.unwrap();
    // Alert 1 is backing off; alert 2 must not overtake it
    let report = worker.run_cycle(1_001).await.unwrap();
    assert_eq!(report, CycleReport::default());
    assert!(received.lock().is_empty());

    worker.run_cycle(1_000 + CYCLE_GAP_MS).await.unwrap();
    assert_eq!(*received.lock(), vec![1, 2]);
}

#[tokio::test]
async fn test_lost_ack_is_resent_and_deduped() {
    let mut collector = CollectorDouble::new(KEY);
    collector.lose_next_ack = true;
    let received = collector.received.clone();
    let (outbox, sink, mut worker) = setup(20, collector);
    sink.submit(&alert(7)).unwrap();

    worker.run_cycle(0).await.unwrap();
    assert_eq!(outbox.get(7).unwrap().unwrap().state, OutboxState::Failed);
    worker.run_cycle(CYCLE_GAP_MS).await.unwrap();

    assert_eq!(*received.lock(), vec![7]);
    assert!(outbox.get(7).unwrap().is_none());
}

#[tokio::test]
async fn test_repeated_signature_mismatch_escalates() {
    let collector = CollectorDouble::new(b"a-different-key");
    let (_outbox, sink, mut worker) = setup(20, collector);
    sink.submit(&alert(1)).unwrap();

    let mut now = 0;
    for expected in [false, false, true] {
        now += CYCLE_GAP_MS;
        worker.run_cycle(now).await.unwrap();
        assert_eq!(worker.status().read().key_misconfigured, expected);
    }
    assert!(worker.status().read().connected);
}

#[tokio::test]
async fn test_retry_ceiling_drops_and_moves_on() {
    let mut collector = CollectorDouble::new(KEY);
    collector.offline_attempts = 2;
    let received = collector.received.clone();
    let (outbox, sink, mut worker) = setup(2, collector);
    sink.submit(&alert(1)).unwrap();
    sink.submit(&alert(2)).unwrap();

    worker.run_cycle(CYCLE_GAP_MS).await.unwrap();
    let report = worker.run_cycle(2 * CYCLE_GAP_MS).await.unwrap();
    assert_eq!(report.dropped, 1);
    assert_eq!(outbox.get(1).unwrap().unwrap().state, OutboxState::Dropped);

    worker.run_cycle(3 * CYCLE_GAP_MS).await.unwrap();
    assert_eq!(*received.lock(), vec![2]);
    assert_eq!(worker.status().read().dropped, 1);
}

#[test]
fn test_submit_is_idempotent() {
    let (outbox, sink, _worker) = setup(20, CollectorDouble::new(KEY));
    assert!(sink.submit(&alert(3)).unwrap());
    assert!(!sink.submit(&alert(3)).unwrap());
    assert_eq!(outbox.counts().unwrap().pending, 1);
}
