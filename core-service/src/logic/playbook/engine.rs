//! Playbook Engine
//!
//! Input: one Alert + the current ordered playbook set.
//! Output: one ActionResult per action considered, also written to the audit trail.
//!
//! Every matching playbook runs, in load order. Within a playbook actions
//! run in declared order; a failure only stops the playbook when the action
//! is flagged `abort_on_failure`.
//!
//! At-most-once per (alert, playbook, action index) is enforced by the
//! durable ledger. A target (pid, file, network) already claimed by an
//! earlier playbook for the same alert is skipped, not re-executed.

use std::sync::Arc;

use chrono::Utc;

use crate::logic::detection::Alert;
use crate::logic::response::actions::{ActionExecutor, ActionTarget};
use crate::logic::response::types::{ActionResult, Outcome};
use crate::logic::telemetry::recorder::{self, AuditRecord};

use super::ledger::{Ledger, LedgerState};
use super::types::{ActionSpec, Playbook};

pub struct PlaybookEngine {
    ledger: Ledger,
    executor: Arc<ActionExecutor>,
}

impl PlaybookEngine {
    pub fn new(ledger: Ledger, executor: Arc<ActionExecutor>) -> Self {
        Self { ledger, executor }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn executor(&self) -> &Arc<ActionExecutor> {
        &self.executor
    }

    /// Evaluate `alert` against every playbook; runs the matching ones
    pub fn handle(&self, alert: &Alert, playbooks: &[Playbook]) -> Vec<ActionResult> {
        let mut results = Vec::new();
        let mut matched = 0usize;

        for playbook in playbooks {
            if !playbook.matches(alert) {
                continue;
            }
            matched += 1;
            results.extend(self.run_playbook(alert, playbook));
        }

        if matched > 0 {
            log::info!(
                "[SOAR] Alert #{} ({}) matched {} playbook(s), {} action result(s)",
                alert.id,
                alert.name,
                matched,
                results.len()
            );
        }
        results
    }

    fn run_playbook(&self, alert: &Alert, playbook: &Playbook) -> Vec<ActionResult> {
        let already_done = match self.ledger.playbook_completed(alert.id, &playbook.name) {
            Ok(done) => done,
            Err(e) => {
                log::error!("[SOAR] Ledger read failed for '{}': {}", playbook.name, e);
                false
            }
        };

        let mut results = Vec::with_capacity(playbook.actions.len());
        for (idx, spec) in playbook.actions.iter().enumerate() {
            let result = if already_done {
                let skipped = Outcome::skipped("already executed");
                self.result(alert, playbook, idx, spec, None, skipped, 0)
            } else {
                self.run_action(alert, playbook, idx, spec)
            };

            let abort = spec.abort_on_failure && result.outcome.is_failure();
            recorder::record(AuditRecord::Action {
                result: result.clone(),
            });
            results.push(result);

            if abort {
                log::warn!(
                    "[SOAR] Playbook '{}' aborted after action {} ({}) failed",
                    playbook.name,
                    idx,
                    spec.kind.as_str()
                );
                break;
            }
        }

        // An aborted playbook counts as done: the actions after the abort must stay unrun
        if !already_done {
            if let Err(e) = self.ledger.mark_playbook_completed(alert.id, &playbook.name) {
                log::error!("[SOAR] Ledger write failed for '{}': {}", playbook.name, e);
            }
        }
        results
    }

    fn run_action(
        &self,
        alert: &Alert,
        playbook: &Playbook,
        idx: usize,
        spec: &ActionSpec,
    ) -> ActionResult {
        let kind = spec.kind.as_str();
        let skip = |reason: String| {
            self.result(alert, playbook, idx, spec, None, Outcome::skipped(reason), 0)
        };

        match self.ledger.action_state(alert.id, &playbook.name, idx) {
            Ok(Some(LedgerState::Completed)) => return skip("already executed".into()),
            Ok(Some(LedgerState::Started)) => return skip("interrupted before completion".into()),
            Ok(None) => {}
            Err(e) => {
                log::error!("[SOAR] Ledger read failed: {}", e);
                return skip(format!("ledger unavailable: {}", e));
            }
        }

        if let Err(e) = self.ledger.mark_started(alert.id, &playbook.name, idx, kind) {
            log::error!("[SOAR] Ledger write failed: {}", e);
            return skip(format!("ledger unavailable: {}", e));
        }

        let (target, outcome, duration_ms) = match ActionTarget::resolve(&spec.kind, alert) {
            Err(e) => (None, Outcome::from_error(e), 0),
            Ok(target) => {
                let claimed_by = match target.dedup_key() {
                    Some(key) => self.ledger.claim_target(alert.id, &key, &playbook.name),
                    None => Ok(None),
                };
                match claimed_by {
                    Ok(Some(owner)) => (
                        target.describe(),
                        Outcome::skipped(format!("already handled by playbook {}", owner)),
                        0,
                    ),
                    Ok(None) => {
                        let (outcome, ms) = self.executor.execute(&target, alert, &playbook.name);
                        (target.describe(), outcome, ms)
                    }
                    Err(e) => (
                        target.describe(),
                        Outcome::skipped(format!("ledger unavailable: {}", e)),
                        0,
                    ),
                }
            }
        };

        if let Err(e) = self.ledger.mark_completed(alert.id, &playbook.name, idx, &outcome) {
            log::error!("[SOAR] Ledger write failed: {}", e);
        }
        self.result(alert, playbook, idx, spec, target, outcome, duration_ms)
    }

    #[allow(clippy::too_many_arguments)]
    fn result(
        &self,
        alert: &Alert,
        playbook: &Playbook,
        idx: usize,
        spec: &ActionSpec,
        target: Option<String>,
        outcome: Outcome,
        duration_ms: u64,
    ) -> ActionResult {
        match &outcome {
            Outcome::Success { .. } | Outcome::Skipped { .. } => log::info!(
                "[SOAR] #{} {}[{}] {}: {}",
                alert.id,
                playbook.name,
                idx,
                spec.kind.as_str(),
                outcome
            ),
            Outcome::Failure { .. } => log::error!(
                "[SOAR] #{} {}[{}] {}: {}",
                alert.id,
                playbook.name,
                idx,
                spec.kind.as_str(),
                outcome
            ),
        }
        ActionResult {
            alert_id: alert.id,
            playbook: playbook.name.clone(),
            action_idx: idx,
            kind: spec.kind.as_str().to_string(),
            target,
            outcome,
            timestamp: Utc::now(),
            duration_ms,
        }
    }
}
