//! Idempotency Ledger
//!
//! Durable record of which (alert, playbook, action) triples have run and
//! which action targets have been claimed for an alert. Every call is one
//! statement or one transaction on the shared store, so the detection
//! worker and the transport thread never interleave inside a claim.
//!
//! Alerts handed to the response worker are parked in `soar_pending` in
//! the same transaction that queues them for the collector, and removed
//! once their playbooks ran, so a restart replays what was never handled.

use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::logic::detection::Alert;
use crate::logic::response::types::Outcome;
use crate::logic::store::{Store, StoreError};

/// Ledger status of one action row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerState {
    /// Written before execution; alone it means the agent died mid-action
    Started,
    Completed,
}

impl LedgerState {
    fn as_str(&self) -> &'static str {
        match self {
            LedgerState::Started => "started",
            LedgerState::Completed => "completed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "started" => Some(LedgerState::Started),
            "completed" => Some(LedgerState::Completed),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct Ledger {
    store: Arc<Store>,
}

impl Ledger {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn action_state(
        &self,
        alert_id: u64,
        playbook: &str,
        action_idx: usize,
    ) -> Result<Option<LedgerState>, StoreError> {
        let conn = self.store.conn();
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM action_ledger
                 WHERE alert_id = ?1 AND playbook = ?2 AND action_idx = ?3",
                params![alert_id as i64, playbook, action_idx as i64],
                |row| row.get(0),
            )
            .optional()?;
        Ok(status.as_deref().and_then(LedgerState::parse))
    }

    pub fn mark_started(
        &self,
        alert_id: u64,
        playbook: &str,
        action_idx: usize,
        kind: &str,
    ) -> Result<(), StoreError> {
        let conn = self.store.conn();
        conn.execute(
            "INSERT INTO action_ledger (alert_id, playbook, action_idx, kind, status, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(alert_id, playbook, action_idx) DO NOTHING",
            params![
                alert_id as i64,
                playbook,
                action_idx as i64,
                kind,
                LedgerState::Started.as_str(),
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn mark_completed(
        &self,
        alert_id: u64,
        playbook: &str,
        action_idx: usize,
        outcome: &Outcome,
    ) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(outcome)?;
        let conn = self.store.conn();
        conn.execute(
            "UPDATE action_ledger SET status = ?4, outcome = ?5, updated_at = ?6
             WHERE alert_id = ?1 AND playbook = ?2 AND action_idx = ?3",
            params![
                alert_id as i64,
                playbook,
                action_idx as i64,
                LedgerState::Completed.as_str(),
                encoded,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Claim `target` for `playbook`; returns the playbook already holding it, if another
    pub fn claim_target(
        &self,
        alert_id: u64,
        target: &str,
        playbook: &str,
    ) -> Result<Option<String>, StoreError> {
        let mut conn = self.store.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO action_targets (alert_id, target, playbook, claimed_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(alert_id, target) DO NOTHING",
            params![alert_id as i64, target, playbook, Utc::now().to_rfc3339()],
        )?;
        let owner: String = tx.query_row(
            "SELECT playbook FROM action_targets WHERE alert_id = ?1 AND target = ?2",
            params![alert_id as i64, target],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(if owner == playbook { None } else { Some(owner) })
    }

    pub fn playbook_completed(&self, alert_id: u64, playbook: &str) -> Result<bool, StoreError> {
        let conn = self.store.conn();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM playbook_runs WHERE alert_id = ?1 AND playbook = ?2",
                params![alert_id as i64, playbook],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn mark_playbook_completed(&self, alert_id: u64, playbook: &str) -> Result<(), StoreError> {
        let conn = self.store.conn();
        conn.execute(
            "INSERT OR IGNORE INTO playbook_runs (alert_id, playbook, completed_at)
             VALUES (?1, ?2, ?3)",
            params![alert_id as i64, playbook, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Park an alert for the response worker on the caller's connection
    /// (usually inside the outbox transaction)
    pub fn defer_response(conn: &Connection, alert: &Alert) -> Result<(), StoreError> {
        conn.execute(
            "INSERT OR IGNORE INTO soar_pending (alert_id, alert, queued_at) VALUES (?1, ?2, ?3)",
            params![alert.id as i64, serde_json::to_string(alert)?, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Parked alerts, oldest first
    pub fn deferred_responses(&self) -> Result<Vec<Alert>, StoreError> {
        let conn = self.store.conn();
        let mut stmt = conn.prepare("SELECT alert FROM soar_pending ORDER BY alert_id ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut alerts = Vec::new();
        for text in rows {
            alerts.push(serde_json::from_str(&text?)?);
        }
        Ok(alerts)
    }

    pub fn clear_deferred(&self, alert_id: u64) -> Result<(), StoreError> {
        let conn = self.store.conn();
        conn.execute("DELETE FROM soar_pending WHERE alert_id = ?1", params![alert_id as i64])?;
        Ok(())
    }

    /// Recorded outcome of a completed action
    pub fn outcome(
        &self,
        alert_id: u64,
        playbook: &str,
        action_idx: usize,
    ) -> Result<Option<Outcome>, StoreError> {
        let conn = self.store.conn();
        let raw: Option<Option<String>> = conn
            .query_row(
                "SELECT outcome FROM action_ledger
                 WHERE alert_id = ?1 AND playbook = ?2 AND action_idx = ?3",
                params![alert_id as i64, playbook, action_idx as i64],
                |row| row.get(0),
            )
            .optional()?;
        match raw.flatten() {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> Ledger {
        Ledger::new(Arc::new(Store::open_in_memory().unwrap()))
    }

    #[test]
    fn test_started_then_completed() {
        let ledger = ledger();
        assert_eq!(ledger.action_state(1, "pb", 0).unwrap(), None);

        ledger.mark_started(1, "pb", 0, "notify").unwrap();
        assert_eq!(ledger.action_state(1, "pb", 0).unwrap(), Some(LedgerState::Started));

        ledger
            .mark_completed(1, "pb", 0, &Outcome::success("ok"))
            .unwrap();
        assert_eq!(ledger.action_state(1, "pb", 0).unwrap(), Some(LedgerState::Completed));
        assert_eq!(ledger.outcome(1, "pb", 0).unwrap(), Some(Outcome::success("ok")));
    }

    #[test]
    fn test_target_claim_is_first_come() {
        let ledger = ledger();
        assert_eq!(ledger.claim_target(1, "kill_process:42", "a").unwrap(), None);
        assert_eq!(ledger.claim_target(1, "kill_process:42", "a").unwrap(), None);
        assert_eq!(
            ledger.claim_target(1, "kill_process:42", "b").unwrap(),
            Some("a".to_string())
        );
        // Claims are per alert
        assert_eq!(ledger.claim_target(2, "kill_process:42", "b").unwrap(), None);
    }

    #[test]
    fn test_playbook_runs() {
        let ledger = ledger();
        assert!(!ledger.playbook_completed(5, "pb").unwrap());
        ledger.mark_playbook_completed(5, "pb").unwrap();
        ledger.mark_playbook_completed(5, "pb").unwrap();
        assert!(ledger.playbook_completed(5, "pb").unwrap());
    }
}
