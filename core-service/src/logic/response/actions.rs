//! Action Executors
//!
//! Privileged operations sit behind `ResponsePlatform` so the playbook
//! engine can run against a fake in tests. `ActionExecutor` resolves an
//! action's target from the alert and turns every result into an
//! `Outcome`; nothing here panics or propagates.

use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::Mutex;
use sysinfo::{Pid, System};

use crate::logic::detection::Alert;
use crate::logic::events::NotificationBus;
use crate::logic::playbook::types::ActionKind;

use super::file_quarantine::QuarantineManager;
use super::network;
use super::types::{ActionError, Notification, Outcome};

// ============================================================================
// PLATFORM CAPABILITY
// ============================================================================

/// Host-level capabilities; one implementation per target platform
pub trait ResponsePlatform: Send + Sync {
    fn kill_process(&self, pid: u32) -> Result<String, ActionError>;
    fn isolate_network(&self) -> Result<String, ActionError>;
}

/// The real host
pub struct HostPlatform;

impl ResponsePlatform for HostPlatform {
    fn kill_process(&self, pid: u32) -> Result<String, ActionError> {
        kill_process(pid)
    }

    fn isolate_network(&self) -> Result<String, ActionError> {
        network::isolate_network()
    }
}

// ============================================================================
// KILL
// ============================================================================

fn process_name(pid: u32) -> Option<String> {
    let mut sys = System::new();
    if !sys.refresh_process(Pid::from_u32(pid)) {
        return None;
    }
    sys.process(Pid::from_u32(pid))
        .map(|p| p.name().to_string())
}

fn classify_kill_failure(pid: u32, text: &str) -> ActionError {
    let lower = text.to_lowercase();
    if lower.contains("access is denied")
        || lower.contains("operation not permitted")
        || lower.contains("permission denied")
    {
        ActionError::PermissionDenied(format!("pid {}: {}", pid, text.trim()))
    } else if lower.contains("not found") || lower.contains("no such process") {
        ActionError::NotFound(format!("pid {}", pid))
    } else {
        ActionError::CommandFailed(format!("pid {}: {}", pid, text.trim()))
    }
}

/// Terminate a process by id
pub fn kill_process(pid: u32) -> Result<String, ActionError> {
    if pid <= 4 || pid == std::process::id() {
        return Err(ActionError::InvalidTarget(format!("refusing to kill pid {}", pid)));
    }

    let name = process_name(pid).ok_or_else(|| ActionError::NotFound(format!("pid {}", pid)))?;
    let pid_str = pid.to_string();

    let output = if cfg!(windows) {
        Command::new("taskkill").args(["/F", "/PID", &pid_str]).output()
    } else {
        Command::new("kill").args(["-9", &pid_str]).output()
    };

    match output {
        Ok(output) if output.status.success() => {
            log::warn!("[SOAR] Killed process {} ({})", pid, name);
            Ok(format!("killed {} ({})", pid, name))
        }
        Ok(output) => {
            let text = format!(
                "{} {}",
                String::from_utf8_lossy(&output.stderr),
                String::from_utf8_lossy(&output.stdout)
            );
            Err(classify_kill_failure(pid, &text))
        }
        Err(e) => Err(ActionError::CommandFailed(e.to_string())),
    }
}

// ============================================================================
// TARGETS
// ============================================================================

/// Concrete target of an action, resolved from its `ActionSpec` and the alert
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionTarget {
    Process(u32),
    Network,
    File(PathBuf),
    Notify(Option<String>),
}

impl ActionTarget {
    pub fn resolve(kind: &ActionKind, alert: &Alert) -> Result<Self, ActionError> {
        match kind {
            ActionKind::KillProcess { pid } => pid
                .or_else(|| alert.event_ref.process.as_ref().map(|p| p.pid))
                .filter(|p| *p != 0)
                .map(ActionTarget::Process)
                .ok_or_else(|| ActionError::InvalidTarget("alert carries no process".into())),
            ActionKind::IsolateNetwork => Ok(ActionTarget::Network),
            ActionKind::QuarantineFile { path } => path
                .clone()
                .or_else(|| alert.event_ref.path.as_ref().map(PathBuf::from))
                .map(ActionTarget::File)
                .ok_or_else(|| ActionError::InvalidTarget("alert carries no file path".into())),
            ActionKind::Notify { message } => Ok(ActionTarget::Notify(message.clone())),
        }
    }

    /// Cross-playbook dedup key; notifications are never deduplicated
    pub fn dedup_key(&self) -> Option<String> {
        match self {
            ActionTarget::Process(pid) => Some(format!("kill_process:{}", pid)),
            ActionTarget::Network => Some("isolate_network".to_string()),
            ActionTarget::File(path) => Some(format!("quarantine_file:{}", path.display())),
            ActionTarget::Notify(_) => None,
        }
    }

    pub fn describe(&self) -> Option<String> {
        match self {
            ActionTarget::Process(pid) => Some(format!("pid:{}", pid)),
            ActionTarget::Network => Some("all_interfaces".to_string()),
            ActionTarget::File(path) => Some(path.display().to_string()),
            ActionTarget::Notify(_) => None,
        }
    }
}

// ============================================================================
// EXECUTOR
// ============================================================================

pub struct ActionExecutor {
    platform: Arc<dyn ResponsePlatform>,
    quarantine: Arc<Mutex<QuarantineManager>>,
    bus: NotificationBus,
}

impl ActionExecutor {
    pub fn new(
        platform: Arc<dyn ResponsePlatform>,
        quarantine: Arc<Mutex<QuarantineManager>>,
        bus: NotificationBus,
    ) -> Self {
        Self {
            platform,
            quarantine,
            bus,
        }
    }

    pub fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    pub fn quarantine(&self) -> &Arc<Mutex<QuarantineManager>> {
        &self.quarantine
    }

    /// Run one resolved action; returns its outcome and elapsed milliseconds
    pub fn execute(&self, target: &ActionTarget, alert: &Alert, playbook: &str) -> (Outcome, u64) {
        let start = Instant::now();
        let outcome = match target {
            ActionTarget::Process(pid) => Outcome::from_result(self.platform.kill_process(*pid)),
            ActionTarget::Network => Outcome::from_result(self.platform.isolate_network()),
            ActionTarget::File(path) => {
                let result = self
                    .quarantine
                    .lock()
                    .quarantine(path, &alert.name, Some(alert.id))
                    .map(|entry| format!("quarantined as {}", entry.id));
                Outcome::from_result(result)
            }
            ActionTarget::Notify(message) => self.notify(alert, playbook, message.as_deref()),
        };
        (outcome, start.elapsed().as_millis() as u64)
    }

    /// Publishing never blocks and never fails the playbook
    fn notify(&self, alert: &Alert, playbook: &str, message: Option<&str>) -> Outcome {
        let notification = Notification {
            alert_id: alert.id,
            playbook: playbook.to_string(),
            severity: alert.severity,
            title: alert.name.clone(),
            message: message.unwrap_or(&alert.message).to_string(),
            host: alert.event_ref.host.clone(),
            timestamp: Utc::now(),
        };
        let reached = self.bus.publish(notification);
        Outcome::success(format!("published to {} subscriber(s)", reached))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::logic::detection::{Finding, Severity};
    use crate::logic::telemetry::event::{Event, EventKind, ProcessInfo};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records calls instead of touching the host
    #[derive(Default)]
    pub struct MockPlatform {
        pub kills: Mutex<Vec<u32>>,
        pub isolations: AtomicUsize,
        pub kill_error: Mutex<Option<ActionError>>,
        pub isolate_error: Mutex<Option<ActionError>>,
    }

    impl ResponsePlatform for MockPlatform {
        fn kill_process(&self, pid: u32) -> Result<String, ActionError> {
            if let Some(e) = self.kill_error.lock().clone() {
                return Err(e);
            }
            self.kills.lock().push(pid);
            Ok(format!("killed {}", pid))
        }

        fn isolate_network(&self) -> Result<String, ActionError> {
            if let Some(e) = self.isolate_error.lock().clone() {
                return Err(e);
            }
            self.isolations.fetch_add(1, Ordering::SeqCst);
            Ok("isolated".into())
        }
    }

    pub fn alert_for(pid: u32, path: Option<&str>) -> Alert {
        let mut event = Event::new(EventKind::Process, "start", "host-1")
            .with_process(ProcessInfo::new(pid, "powershell.exe"));
        if let Some(p) = path {
            event = event.with_path(PathBuf::from(p));
        }
        Alert::from_finding(
            1,
            event.summary(),
            Finding::new(Severity::Error, 70, "lolbin_encoded_command", "test".into()),
        )
    }

    #[test]
    fn test_resolve_targets() {
        let alert = alert_for(321, Some("/tmp/x.locked"));
        assert_eq!(
            ActionTarget::resolve(&ActionKind::KillProcess { pid: None }, &alert).unwrap(),
            ActionTarget::Process(321)
        );
        assert_eq!(
            ActionTarget::resolve(&ActionKind::KillProcess { pid: Some(9) }, &alert).unwrap(),
            ActionTarget::Process(9)
        );
        assert_eq!(
            ActionTarget::resolve(&ActionKind::QuarantineFile { path: None }, &alert)
                .unwrap()
                .dedup_key()
                .unwrap(),
            "quarantine_file:/tmp/x.locked"
        );
        assert!(ActionTarget::resolve(&ActionKind::Notify { message: None }, &alert)
            .unwrap()
            .dedup_key()
            .is_none());
    }

    #[test]
    fn test_resolve_without_path_is_invalid() {
        let alert = alert_for(321, None);
        assert!(matches!(
            ActionTarget::resolve(&ActionKind::QuarantineFile { path: None }, &alert),
            Err(ActionError::InvalidTarget(_))
        ));
    }

    #[test]
    fn test_kill_refuses_self_and_system() {
        assert!(matches!(kill_process(4), Err(ActionError::InvalidTarget(_))));
        assert!(matches!(
            kill_process(std::process::id()),
            Err(ActionError::InvalidTarget(_))
        ));
    }

    #[test]
    fn test_kill_failure_classification() {
        assert!(matches!(
            classify_kill_failure(10, "ERROR: Access is denied."),
            ActionError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify_kill_failure(10, "kill: (10) - No such process"),
            ActionError::NotFound(_)
        ));
    }

    #[test]
    fn test_notify_publishes() {
        let dir = tempfile::TempDir::new().unwrap();
        let bus = NotificationBus::new(4);
        let mut rx = bus.subscribe();
        let exec = ActionExecutor::new(
            Arc::new(MockPlatform::default()),
            Arc::new(Mutex::new(QuarantineManager::new(dir.path().join("q")).unwrap())),
            bus,
        );
        let alert = alert_for(1, None);
        let (outcome, _) = exec.execute(&ActionTarget::Notify(Some("hello".into())), &alert, "pb");
        assert!(outcome.is_success());
        assert_eq!(rx.try_recv().unwrap().message, "hello");
    }
}
