//! Durable Outbox
//!
//! State machine per alert:
//! ```text
//! PENDING -> SENT -> ACKED            (row deleted)
//! PENDING -> SENT -> FAILED -> PENDING (after backoff)
//! PENDING -> DROPPED                  (retry ceiling; row kept as archive)
//! ```
//! Rows are always served oldest alert id first.

use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::logic::store::{Store, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxState {
    Pending,
    Sent,
    Failed,
    Dropped,
}

impl OutboxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxState::Pending => "PENDING",
            OutboxState::Sent => "SENT",
            OutboxState::Failed => "FAILED",
            OutboxState::Dropped => "DROPPED",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "SENT" => OutboxState::Sent,
            "FAILED" => OutboxState::Failed,
            "DROPPED" => OutboxState::Dropped,
            _ => OutboxState::Pending,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEntry {
    pub alert_id: u64,
    pub payload: Vec<u8>,
    pub state: OutboxState,
    pub attempts: u32,
    pub next_attempt_ms: i64,
    pub last_error: Option<String>,
}

impl OutboxEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let state: String = row.get(2)?;
        Ok(Self {
            alert_id: row.get::<_, i64>(0)? as u64,
            payload: row.get(1)?,
            state: OutboxState::parse(&state),
            attempts: row.get::<_, i64>(3)? as u32,
            next_attempt_ms: row.get(4)?,
            last_error: row.get(5)?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutboxCounts {
    pub pending: u64,
    pub sent: u64,
    pub failed: u64,
    pub dropped: u64,
}

impl OutboxCounts {
    /// Alerts still owed to the collector
    pub fn undelivered(&self) -> u64 {
        self.pending + self.sent + self.failed
    }
}

const SELECT_COLUMNS: &str =
    "SELECT alert_id, payload, state, attempts, next_attempt_ms, last_error FROM outbox";

#[derive(Clone)]
pub struct Outbox {
    store: Arc<Store>,
}

impl Outbox {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Insert a new PENDING row; false if the alert is already queued
    pub fn enqueue(&self, alert_id: u64, payload: &[u8]) -> Result<bool, StoreError> {
        self.enqueue_with(alert_id, payload, |_| Ok(()))
    }

    /// `enqueue`, committing `also` in the same transaction
    pub fn enqueue_with<F>(&self, alert_id: u64, payload: &[u8], also: F) -> Result<bool, StoreError>
    where
        F: FnOnce(&Connection) -> Result<(), StoreError>,
    {
        let now = Utc::now().to_rfc3339();
        let mut conn = self.store.conn();
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO outbox
                (alert_id, payload, state, attempts, next_attempt_ms, created_at, updated_at)
             VALUES (?1, ?2, ?3, 0, 0, ?4, ?4)",
            params![alert_id as i64, payload, OutboxState::Pending.as_str(), now],
        )?;
        also(&tx)?;
        tx.commit()?;
        Ok(inserted == 1)
    }

    /// After a restart nothing is in flight: SENT rows go back to PENDING
    pub fn recover(&self) -> Result<usize, StoreError> {
        let conn = self.store.conn();
        let n = conn.execute(
            "UPDATE outbox SET state = ?1, updated_at = ?3 WHERE state = ?2",
            params![
                OutboxState::Pending.as_str(),
                OutboxState::Sent.as_str(),
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(n)
    }

    /// FAILED rows whose backoff expired become PENDING; then the oldest
    /// undelivered rows are returned, due or not
    pub fn head(&self, now_ms: i64, limit: usize) -> Result<Vec<OutboxEntry>, StoreError> {
        let mut conn = self.store.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE outbox SET state = ?1 WHERE state = ?2 AND next_attempt_ms <= ?3",
            params![
                OutboxState::Pending.as_str(),
                OutboxState::Failed.as_str(),
                now_ms
            ],
        )?;
        let entries = {
            let mut stmt = tx.prepare(&format!(
                "{} WHERE state IN (?1, ?2) ORDER BY alert_id ASC LIMIT ?3",
                SELECT_COLUMNS
            ))?;
            let rows = stmt.query_map(
                params![
                    OutboxState::Pending.as_str(),
                    OutboxState::Failed.as_str(),
                    limit as i64
                ],
                OutboxEntry::from_row,
            )?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        tx.commit()?;
        Ok(entries)
    }

    pub fn get(&self, alert_id: u64) -> Result<Option<OutboxEntry>, StoreError> {
        let conn = self.store.conn();
        let entry = conn
            .query_row(
                &format!("{} WHERE alert_id = ?1", SELECT_COLUMNS),
                params![alert_id as i64],
                OutboxEntry::from_row,
            )
            .optional()?;
        Ok(entry)
    }

    fn set_state(&self, alert_id: u64, state: OutboxState) -> Result<(), StoreError> {
        let conn = self.store.conn();
        conn.execute(
            "UPDATE outbox SET state = ?2, updated_at = ?3 WHERE alert_id = ?1",
            params![alert_id as i64, state.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn mark_sent(&self, alert_id: u64) -> Result<(), StoreError> {
        self.set_state(alert_id, OutboxState::Sent)
    }

    /// Acknowledged by the collector: removed from the queue
    pub fn mark_acked(&self, alert_id: u64) -> Result<(), StoreError> {
        let conn = self.store.conn();
        conn.execute("DELETE FROM outbox WHERE alert_id = ?1", params![alert_id as i64])?;
        Ok(())
    }

    /// Record a failed attempt; returns the new attempt count
    pub fn mark_failed(
        &self,
        alert_id: u64,
        error: &str,
        next_attempt_ms: i64,
    ) -> Result<u32, StoreError> {
        let conn = self.store.conn();
        conn.execute(
            "UPDATE outbox
             SET state = ?2, attempts = attempts + 1, next_attempt_ms = ?3,
                 last_error = ?4, updated_at = ?5
             WHERE alert_id = ?1",
            params![
                alert_id as i64,
                OutboxState::Failed.as_str(),
                next_attempt_ms,
                error,
                Utc::now().to_rfc3339()
            ],
        )?;
        let attempts: i64 = conn.query_row(
            "SELECT attempts FROM outbox WHERE alert_id = ?1",
            params![alert_id as i64],
            |row| row.get(0),
        )?;
        Ok(attempts as u32)
    }

    pub fn mark_dropped(&self, alert_id: u64, reason: &str) -> Result<(), StoreError> {
        let conn = self.store.conn();
        conn.execute(
            "UPDATE outbox SET state = ?2, last_error = ?3, updated_at = ?4 WHERE alert_id = ?1",
            params![
                alert_id as i64,
                OutboxState::Dropped.as_str(),
                reason,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn counts(&self) -> Result<OutboxCounts, StoreError> {
        let conn = self.store.conn();
        let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM outbox GROUP BY state")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;
        let mut counts = OutboxCounts::default();
        for row in rows {
            let (state, n) = row?;
            match OutboxState::parse(&state) {
                OutboxState::Pending => counts.pending += n,
                OutboxState::Sent => counts.sent += n,
                OutboxState::Failed => counts.failed += n,
                OutboxState::Dropped => counts.dropped += n,
            }
        }
        Ok(counts)
    }
}

/// Exponential backoff without jitter: base * 2^(attempts-1), capped
pub fn backoff_ms(attempts: u32, base_ms: u64, max_ms: u64) -> u64 {
    let exp = attempts.saturating_sub(1).min(32);
    base_ms.saturating_mul(1u64 << exp).min(max_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn outbox() -> Outbox {
        Outbox::new(Arc::new(Store::open_in_memory().unwrap()))
    }

    #[test]
    fn test_head_is_oldest_first() {
        let ob = outbox();
        for id in [3u64, 1, 2] {
            assert!(ob.enqueue(id, format!("p{}", id).as_bytes()).unwrap());
        }
        assert!(!ob.enqueue(1, b"again").unwrap());
        let ids: Vec<_> = ob.head(0, 10).unwrap().iter().map(|e| e.alert_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_enqueue_with_rolls_back_together() {
        let ob = outbox();
        let err = ob.enqueue_with(1, b"p", |conn| {
            conn.execute("INSERT INTO no_such_table VALUES (1)", [])?;
            Ok(())
        });
        assert!(err.is_err());
        assert!(ob.get(1).unwrap().is_none());
    }

    #[test]
    fn test_failure_backoff_then_pending() {
        let ob = outbox();
        ob.enqueue(1, b"p").unwrap();
        ob.mark_sent(1).unwrap();
        assert_eq!(ob.mark_failed(1, "offline", 5_000).unwrap(), 1);

        let early = ob.head(1_000, 10).unwrap();
        assert_eq!(early[0].state, OutboxState::Failed);

        let due = ob.head(5_000, 10).unwrap();
        assert_eq!(due[0].state, OutboxState::Pending);
        assert_eq!(due[0].attempts, 1);
        assert_eq!(due[0].last_error.as_deref(), Some("offline"));
    }

    #[test]
    fn test_ack_removes_and_drop_archives() {
        let ob = outbox();
        ob.enqueue(1, b"a").unwrap();
        ob.enqueue(2, b"b").unwrap();
        ob.mark_acked(1).unwrap();
        ob.mark_dropped(2, "max retries").unwrap();

        assert!(ob.get(1).unwrap().is_none());
        assert_eq!(ob.get(2).unwrap().unwrap().state, OutboxState::Dropped);
        assert!(ob.head(i64::MAX, 10).unwrap().is_empty());
        let counts = ob.counts().unwrap();
        assert_eq!(counts.dropped, 1);
        assert_eq!(counts.undelivered(), 0);
    }

    #[test]
    fn test_sent_rows_recovered_after_restart() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agent.db");
        {
            let ob = Outbox::new(Arc::new(Store::open(&path).unwrap()));
            ob.enqueue(9, b"in flight").unwrap();
            ob.mark_sent(9).unwrap();
        }
        let ob = Outbox::new(Arc::new(Store::open(&path).unwrap()));
        assert!(ob.head(0, 10).unwrap().is_empty());
        assert_eq!(ob.recover().unwrap(), 1);
        assert_eq!(ob.head(0, 10).unwrap()[0].payload, b"in flight".to_vec());
    }

    #[test]
    fn test_backoff_is_capped() {
        assert_eq!(backoff_ms(1, 500, 60_000), 500);
        assert_eq!(backoff_ms(2, 500, 60_000), 1_000);
        assert_eq!(backoff_ms(4, 500, 60_000), 4_000);
        assert_eq!(backoff_ms(20, 500, 60_000), 60_000);
        assert_eq!(backoff_ms(1000, 500, 60_000), 60_000);
    }
}
