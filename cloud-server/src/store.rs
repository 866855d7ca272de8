//! In-memory alert store
//!
//! Bounded at `max_alerts`; the oldest alert is evicted first. Alerts are
//! deduplicated by `(agent_id, id)`. The dedup window is larger than the
//! store so a late redelivery of an evicted alert is still recognised.

use std::collections::{HashSet, VecDeque};

use chrono::Utc;
use tokio::sync::RwLock;

use crate::models::{AlertFilter, AlertPayload, IngestStatus, StoredAlert};

const DEDUP_WINDOW_FACTOR: usize = 4;
const DEFAULT_LIST_LIMIT: usize = 100;

type AlertKey = (String, u64);

struct Inner {
    alerts: VecDeque<StoredAlert>,
    seen: HashSet<AlertKey>,
    seen_order: VecDeque<AlertKey>,
}

pub struct AlertStore {
    inner: RwLock<Inner>,
    max_alerts: usize,
}

impl AlertStore {
    pub fn new(max_alerts: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                alerts: VecDeque::new(),
                seen: HashSet::new(),
                seen_order: VecDeque::new(),
            }),
            max_alerts: max_alerts.max(1),
        }
    }

    pub async fn insert(&self, alert: AlertPayload) -> IngestStatus {
        let key = (alert.agent_id.clone(), alert.id);
        let mut inner = self.inner.write().await;
        if !inner.seen.insert(key.clone()) {
            return IngestStatus::Duplicate;
        }
        inner.seen_order.push_back(key);
        while inner.seen_order.len() > self.max_alerts * DEDUP_WINDOW_FACTOR {
            if let Some(old) = inner.seen_order.pop_front() {
                inner.seen.remove(&old);
            }
        }

        inner.alerts.push_back(StoredAlert {
            received_at: Utc::now(),
            alert,
        });
        while inner.alerts.len() > self.max_alerts {
            inner.alerts.pop_front();
        }
        IngestStatus::Accepted
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.alerts.len()
    }

    /// Newest first
    pub async fn list(&self, filter: &AlertFilter) -> Vec<StoredAlert> {
        let limit = filter.limit.unwrap_or(DEFAULT_LIST_LIMIT);
        let inner = self.inner.read().await;
        inner
            .alerts
            .iter()
            .rev()
            .filter(|s| filter.agent_id.as_ref().map_or(true, |a| &s.alert.agent_id == a))
            .filter(|s| {
                filter
                    .severity
                    .as_ref()
                    .map_or(true, |sev| s.alert.severity.eq_ignore_ascii_case(sev))
            })
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn get(&self, agent_id: &str, id: u64) -> Option<StoredAlert> {
        self.inner
            .read()
            .await
            .alerts
            .iter()
            .find(|s| s.alert.agent_id == agent_id && s.alert.id == id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub fn payload(agent: &str, id: u64, severity: &str) -> AlertPayload {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "agent_id": agent,
            "event_type": "file",
            "severity": severity,
            "score": 60,
            "timestamp": "2026-10-16T10:00:00Z",
            "host": "ws-1",
            "signals": {}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_dedup_by_agent_and_id() {
        let store = AlertStore::new(10);
        assert_eq!(store.insert(payload("a", 1, "WARNING")).await, IngestStatus::Accepted);
        assert_eq!(store.insert(payload("a", 1, "WARNING")).await, IngestStatus::Duplicate);
        assert_eq!(store.insert(payload("b", 1, "WARNING")).await, IngestStatus::Accepted);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_cap_evicts_oldest_but_remembers_ids() {
        let store = AlertStore::new(2);
        for id in 1..=3 {
            store.insert(payload("a", id, "INFO")).await;
        }
        let ids: Vec<u64> = store.list(&AlertFilter::default()).await.iter().map(|s| s.alert.id).collect();
        assert_eq!(ids, vec![3, 2]);
        assert_eq!(store.insert(payload("a", 1, "INFO")).await, IngestStatus::Duplicate);
    }

    #[tokio::test]
    async fn test_filter_by_severity() {
        let store = AlertStore::new(10);
        store.insert(payload("a", 1, "INFO")).await;
        store.insert(payload("a", 2, "CRITICAL")).await;
        let filter = AlertFilter {
            severity: Some("critical".into()),
            ..Default::default()
        };
        let found = store.list(&filter).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].alert.id, 2);
        assert!(store.get("a", 2).await.is_some());
        assert!(store.get("b", 2).await.is_none());
    }
}
