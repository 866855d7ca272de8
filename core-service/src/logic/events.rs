//! Notification Bus
//!
//! `notify` actions publish here; the executor never knows who listens.
//! Subscribers: the log sink (always) and the follow-up alert republisher
//! (when `response.notify_republish` is set).

use tokio::sync::broadcast;

use crate::logic::response::types::Notification;

#[derive(Clone)]
pub struct NotificationBus {
    tx: broadcast::Sender<Notification>,
}

impl NotificationBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Non-blocking; returns the number of subscribers reached
    pub fn publish(&self, notification: Notification) -> usize {
        match self.tx.send(notification) {
            Ok(n) => n,
            Err(_) => {
                log::debug!("[Notify] No subscribers, notification not delivered");
                0
            }
        }
    }
}

/// Log every notification until the bus closes
pub fn spawn_log_sink(bus: &NotificationBus) -> std::io::Result<std::thread::JoinHandle<()>> {
    let mut rx = bus.subscribe();
    std::thread::Builder::new()
        .name("notify-log".into())
        .spawn(move || loop {
            match rx.blocking_recv() {
                Ok(n) => log::warn!(
                    "[Notify] {} alert #{} via '{}': {} - {}",
                    n.severity,
                    n.alert_id,
                    n.playbook,
                    n.title,
                    n.message
                ),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("[Notify] Log sink lagged, {} notifications skipped", skipped)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::detection::Severity;
    use chrono::Utc;

    fn sample() -> Notification {
        Notification {
            alert_id: 1,
            playbook: "pb".into(),
            severity: Severity::Warning,
            title: "t".into(),
            message: "m".into(),
            host: "h".into(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_publish_reaches_subscribers() {
        let bus = NotificationBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        assert_eq!(bus.publish(sample()), 2);
        assert_eq!(a.try_recv().unwrap().alert_id, 1);
        assert_eq!(b.try_recv().unwrap().playbook, "pb");
    }

    #[test]
    fn test_publish_without_subscribers_is_harmless() {
        let bus = NotificationBus::new(8);
        assert_eq!(bus.publish(sample()), 0);
    }
}
