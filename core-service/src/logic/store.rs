//! Local Durable Store
//!
//! One SQLite file holds everything that has to survive a crash:
//! the alert id sequence, the playbook idempotency ledger, the
//! action-target ledger, alerts handed to the response worker and the
//! transport outbox.
//!
//! Access is serialised through a single mutex-guarded connection.
//! Table-specific queries live next to their owners
//! (`playbook::ledger`, `transport::outbox`).

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub playbook_runs: usize,
    pub actions: usize,
    pub targets: usize,
    pub dropped_alerts: usize,
}

impl RetentionReport {
    pub fn total(&self) -> usize {
        self.playbook_runs + self.actions + self.targets + self.dropped_alerts
    }
}

pub struct Store {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        let store = Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        };
        store.init_schema()?;
        log::info!("[Store] Opened {:?}", path);
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
            path: None,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );

            -- (alert, playbook) pairs that ran to the end
            CREATE TABLE IF NOT EXISTS playbook_runs (
                alert_id INTEGER NOT NULL,
                playbook TEXT NOT NULL,
                completed_at TEXT NOT NULL,
                PRIMARY KEY (alert_id, playbook)
            );

            -- One row per (alert, playbook, action index); status started|completed
            CREATE TABLE IF NOT EXISTS action_ledger (
                alert_id INTEGER NOT NULL,
                playbook TEXT NOT NULL,
                action_idx INTEGER NOT NULL,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                outcome TEXT,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (alert_id, playbook, action_idx)
            );

            -- Cross-playbook claim on an action target
            CREATE TABLE IF NOT EXISTS action_targets (
                alert_id INTEGER NOT NULL,
                target TEXT NOT NULL,
                playbook TEXT NOT NULL,
                claimed_at TEXT NOT NULL,
                PRIMARY KEY (alert_id, target)
            );

            -- Alerts queued for the response worker, removed once handled
            CREATE TABLE IF NOT EXISTS soar_pending (
                alert_id INTEGER PRIMARY KEY,
                alert TEXT NOT NULL,
                queued_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS outbox (
                alert_id INTEGER PRIMARY KEY,
                payload BLOB NOT NULL,
                state TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                next_attempt_ms INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_outbox_state
                ON outbox(state, alert_id);
        "#,
        )?;
        Ok(())
    }

    /// Exclusive access to the connection
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Reserve `block` consecutive ids; returns the half-open range `[start, end)`
    pub fn reserve_ids(&self, block: u64) -> Result<(u64, u64), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let current: i64 = tx
            .query_row(
                "SELECT value FROM meta WHERE key = 'alert_seq'",
                [],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);
        let end = current as u64 + block;
        tx.execute(
            "INSERT INTO meta (key, value) VALUES ('alert_seq', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![end as i64],
        )?;
        tx.commit()?;
        Ok((current as u64 + 1, end + 1))
    }

    /// Delete finished history older than `cutoff`: ledger rows, target
    /// claims and DROPPED outbox rows. Rows of an alert still waiting for
    /// the response worker are kept.
    pub fn sweep(&self, cutoff: DateTime<Utc>) -> Result<RetentionReport, StoreError> {
        let cutoff = cutoff.to_rfc3339();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let live = "alert_id NOT IN (SELECT alert_id FROM soar_pending)";
        let report = RetentionReport {
            playbook_runs: tx.execute(
                &format!("DELETE FROM playbook_runs WHERE completed_at < ?1 AND {}", live),
                params![cutoff],
            )?,
            actions: tx.execute(
                &format!("DELETE FROM action_ledger WHERE updated_at < ?1 AND {}", live),
                params![cutoff],
            )?,
            targets: tx.execute(
                &format!("DELETE FROM action_targets WHERE claimed_at < ?1 AND {}", live),
                params![cutoff],
            )?,
            dropped_alerts: tx.execute(
                "DELETE FROM outbox WHERE state = 'DROPPED' AND updated_at < ?1",
                params![cutoff],
            )?,
        };
        tx.commit()?;
        Ok(report)
    }

    /// `sweep` with a cutoff `days` before now; 0 keeps everything
    pub fn sweep_older_than(&self, days: u32) -> Result<RetentionReport, StoreError> {
        if days == 0 {
            return Ok(RetentionReport::default());
        }
        let report = self.sweep(Utc::now() - chrono::Duration::days(days as i64))?;
        if report.total() > 0 {
            log::info!(
                "[Store] Retention ({} days): pruned {} playbook run(s), {} action row(s), {} claim(s), {} dropped alert(s)",
                days,
                report.playbook_runs,
                report.actions,
                report.targets,
                report.dropped_alerts
            );
        }
        Ok(report)
    }

    /// Force WAL contents into the main database file
    pub fn checkpoint(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        if self.path.is_some() {
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_reserve_ids_is_monotonic() {
        let store = Store::open_in_memory().unwrap();
        let (a_start, a_end) = store.reserve_ids(10).unwrap();
        let (b_start, b_end) = store.reserve_ids(10).unwrap();
        assert_eq!((a_start, a_end), (1, 11));
        assert_eq!((b_start, b_end), (11, 21));
    }

    fn backdate(store: &Store, table: &str, column: &str, alert_id: u64, at: DateTime<Utc>) {
        store
            .conn()
            .execute(
                &format!("UPDATE {} SET {} = ?1 WHERE alert_id = ?2", table, column),
                params![at.to_rfc3339(), alert_id as i64],
            )
            .unwrap();
    }

    #[test]
    fn test_sweep_prunes_old_history_only() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now().to_rfc3339();
        {
            let conn = store.conn();
            for id in [1i64, 2, 3] {
                conn.execute(
                    "INSERT INTO playbook_runs VALUES (?1, 'pb', ?2)",
                    params![id, now],
                )
                .unwrap();
                conn.execute(
                    "INSERT INTO action_ledger VALUES (?1, 'pb', 0, 'notify', 'completed', NULL, ?2)",
                    params![id, now],
                )
                .unwrap();
                conn.execute(
                    "INSERT INTO action_targets VALUES (?1, 'kill_process:7', 'pb', ?2)",
                    params![id, now],
                )
                .unwrap();
            }
            conn.execute(
                "INSERT INTO outbox (alert_id, payload, state, created_at, updated_at)
                 VALUES (1, x'00', 'DROPPED', ?1, ?1), (2, x'00', 'PENDING', ?1, ?1)",
                params![now],
            )
            .unwrap();
            // Alert 3 is still owed a response
            conn.execute("INSERT INTO soar_pending VALUES (3, '{}', ?1)", params![now])
                .unwrap();
        }
        let old = Utc::now() - chrono::Duration::days(45);
        for id in [1, 3] {
            backdate(&store, "playbook_runs", "completed_at", id, old);
            backdate(&store, "action_ledger", "updated_at", id, old);
            backdate(&store, "action_targets", "claimed_at", id, old);
        }
        for id in [1, 2] {
            backdate(&store, "outbox", "updated_at", id, old);
        }

        let report = store.sweep_older_than(30).unwrap();
        assert_eq!(
            report,
            RetentionReport {
                playbook_runs: 1,
                actions: 1,
                targets: 1,
                dropped_alerts: 1,
            }
        );

        let conn = store.conn();
        let runs: Vec<i64> = conn
            .prepare("SELECT alert_id FROM playbook_runs ORDER BY alert_id")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(runs, vec![2, 3]);
        // Undelivered alerts are never pruned, however old
        let outbox: i64 = conn
            .query_row("SELECT COUNT(*) FROM outbox WHERE alert_id = 2", [], |row| row.get(0))
            .unwrap();
        assert_eq!(outbox, 1);
    }

    #[test]
    fn test_zero_retention_keeps_everything() {
        let store = Store::open_in_memory().unwrap();
        store
            .conn()
            .execute(
                "INSERT INTO playbook_runs VALUES (1, 'pb', '2000-01-01T00:00:00+00:00')",
                [],
            )
            .unwrap();
        assert_eq!(store.sweep_older_than(0).unwrap().total(), 0);
        assert_eq!(store.sweep_older_than(1).unwrap().playbook_runs, 1);
    }

    #[test]
    fn test_sequence_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agent.db");
        {
            let store = Store::open(&path).unwrap();
            store.reserve_ids(64).unwrap();
        }
        let store = Store::open(&path).unwrap();
        let (start, _) = store.reserve_ids(64).unwrap();
        assert_eq!(start, 65);
    }
}
