//! Detection Engine
//!
//! Owns all detector state. Only the detection worker calls into it, so
//! burst windows are plain owned maps with no locking.

use std::sync::Arc;

use crate::logic::config::types::DetectionConfig;
use crate::logic::telemetry::event::Event;

use super::burst::{BurstDetector, BurstHit};
use super::entropy::EntropyDetector;
use super::heuristics::HeuristicDetector;
use super::types::{Alert, AlertSequence, Finding, Severity};

#[derive(Debug, Clone, Copy, Default)]
pub struct EngineStats {
    pub events: u64,
    pub alerts: u64,
    pub unscored: u64,
}

pub struct DetectionEngine {
    burst: BurstDetector,
    entropy: EntropyDetector,
    heuristics: HeuristicDetector,
    ids: Arc<AlertSequence>,
    stats: EngineStats,
}

impl DetectionEngine {
    pub fn new(cfg: &DetectionConfig, ids: Arc<AlertSequence>) -> Self {
        Self {
            burst: BurstDetector::new(cfg.file_burst_threshold_per_sec, cfg.watch_paths.clone()),
            entropy: Self::entropy_from(cfg),
            heuristics: Self::heuristics_from(cfg),
            ids,
            stats: EngineStats::default(),
        }
    }

    fn entropy_from(cfg: &DetectionConfig) -> EntropyDetector {
        EntropyDetector::new(
            cfg.entropy_threshold,
            cfg.entropy_min_sample_threshold,
            cfg.normalized_watchlist(),
        )
    }

    fn heuristics_from(cfg: &DetectionConfig) -> HeuristicDetector {
        HeuristicDetector::new(
            &cfg.ransom_note_names,
            cfg.cpu_usage_threshold,
            cfg.io_write_threshold_bytes,
        )
    }

    /// Swap thresholds after a config reload; open burst windows survive
    pub fn apply_config(&mut self, cfg: &DetectionConfig) {
        self.burst
            .reconfigure(cfg.file_burst_threshold_per_sec, cfg.watch_paths.clone());
        self.entropy = Self::entropy_from(cfg);
        self.heuristics = Self::heuristics_from(cfg);
        log::info!(
            "[Detection] Config applied (burst threshold {}/s, {} watch paths)",
            cfg.file_burst_threshold_per_sec,
            cfg.watch_paths.len()
        );
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    /// Score one event. Alerts come out in event order: a burst window
    /// closed by this event precedes the event's own alert.
    pub fn evaluate(&mut self, event: &Event) -> Vec<Alert> {
        self.stats.events += 1;
        let mut alerts = Vec::new();

        if let Some(hit) = self.burst.observe(event) {
            alerts.push(self.burst_alert(hit));
        }

        let mut findings: Vec<Finding> = Vec::new();
        findings.extend(self.entropy.evaluate(event));
        findings.extend(self.heuristics.evaluate(event));

        if let Some(finding) = Self::combine(findings) {
            let signals = Alert::merged_signals(event, &finding);
            let mut alert = Alert::from_finding(self.ids.next_id(), event.summary(), finding);
            alert.signals = signals;
            alerts.push(alert);
        } else if Self::unscoreable(event) {
            self.stats.unscored += 1;
            let finding = Finding::new(
                Severity::Info,
                0,
                "unscored_event",
                format!(
                    "{}/{} event could not be fully scored",
                    event.kind, event.subtype
                ),
            );
            let signals = Alert::merged_signals(event, &finding);
            let mut alert = Alert::from_finding(self.ids.next_id(), event.summary(), finding);
            alert.signals = signals;
            alerts.push(alert);
        }

        for alert in &alerts {
            log::debug!(
                "[Detection] Alert #{} {} {} (score {})",
                alert.id,
                alert.severity,
                alert.name,
                alert.score
            );
        }
        self.stats.alerts += alerts.len() as u64;
        alerts
    }

    /// Close burst windows older than one second
    pub fn flush(&mut self, now_ns: u64) -> Vec<Alert> {
        let hits = self.burst.flush(now_ns);
        self.burst_alerts(hits)
    }

    /// Close every open window (shutdown)
    pub fn drain(&mut self) -> Vec<Alert> {
        let hits = self.burst.drain();
        self.burst_alerts(hits)
    }

    fn burst_alerts(&mut self, hits: Vec<BurstHit>) -> Vec<Alert> {
        let alerts: Vec<Alert> = hits.into_iter().map(|h| self.burst_alert(h)).collect();
        self.stats.alerts += alerts.len() as u64;
        alerts
    }

    fn burst_alert(&self, hit: BurstHit) -> Alert {
        log::warn!(
            "[Detection] File burst under {:?}: {} writes/s",
            hit.watch_path,
            hit.count
        );
        let signals = hit.finding.signals.clone();
        let mut alert = Alert::from_finding(self.ids.next_id(), hit.event_ref, hit.finding);
        alert.signals = signals;
        alert
    }

    /// Max severity wins (score breaks ties); indicators are unioned and
    /// any finding asking for containment makes the alert containable
    fn combine(findings: Vec<Finding>) -> Option<Finding> {
        let mut iter = findings.into_iter();
        let mut top = iter.next()?;
        let mut others = 0;
        for f in iter {
            others += 1;
            let (mut winner, loser) = if f.outranks(&top) { (f, top) } else { (top, f) };
            winner.auto_contain |= loser.auto_contain;
            for tag in &loser.indicators {
                winner = winner.indicator(tag);
            }
            for (k, v) in loser.signals {
                winner.signals.entry(k).or_insert(v);
            }
            top = winner;
        }
        if others > 0 {
            top.message = format!("{} (+{} more)", top.message, others);
        }
        Some(top)
    }

    fn unscoreable(event: &Event) -> bool {
        event.signal_flag("partial") || event.raw_signals.contains_key("entropy_error")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::telemetry::event::{EventKind, ProcessInfo, Timestamp};
    use chrono::Utc;
    use std::path::PathBuf;

    fn engine(threshold: u32) -> DetectionEngine {
        let cfg = DetectionConfig {
            file_burst_threshold_per_sec: threshold,
            watch_paths: vec![PathBuf::from("/home/u/Desktop")],
            ext_watchlist: vec![".locked".into()],
            ..Default::default()
        };
        DetectionEngine::new(&cfg, Arc::new(AlertSequence::in_memory()))
    }

    #[test]
    fn test_scenario_burst_250_creates() {
        let mut e = engine(120);
        let mut alerts = Vec::new();
        for i in 0..250u64 {
            let ev = Event::new(EventKind::File, "create", "h")
                .with_path(PathBuf::from(format!("/home/u/Desktop/doc{}.txt", i)))
                .at(Timestamp::from_parts(i * 2_000_000, Utc::now()));
            alerts.extend(e.evaluate(&ev));
        }
        alerts.extend(e.flush(2_000_000_000));

        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Warning);
        assert!(alerts[0].score >= 60);
        assert_eq!(alerts[0].signals.get("burst_count").and_then(|v| v.as_u64()), Some(250));
    }

    #[test]
    fn test_max_severity_wins() {
        // Ransom note (ERROR) renamed onto a watch-listed extension with low entropy (WARNING)
        let cfg = DetectionConfig {
            ext_watchlist: vec!["txt".into()],
            ..Default::default()
        };
        let mut e = DetectionEngine::new(&cfg, Arc::new(AlertSequence::in_memory()));
        let ev = Event::new(EventKind::File, "rename", "h")
            .with_path(PathBuf::from("/home/u/Desktop/HOW_TO_DECRYPT.txt"))
            .with_signal("entropy", 3.0)
            .with_signal("entropy_min", 2.0);
        let alerts = e.evaluate(&ev);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Error);
        assert_eq!(alerts[0].name, "ransom_note");
        assert!(alerts[0].indicators.contains(&"ransomware_extension".to_string()));
    }

    #[test]
    fn test_containment_survives_a_higher_scoring_finding() {
        let containable = Finding::new(Severity::Critical, 90, "encrypted_rename", "a".into()).contain();
        let louder = Finding::new(Severity::Critical, 95, "wannacry_binary", "b".into());
        let top = DetectionEngine::combine(vec![containable, louder]).unwrap();
        assert_eq!(top.name, "wannacry_binary");
        assert!(top.auto_contain);

        let calm = DetectionEngine::combine(vec![
            Finding::new(Severity::Warning, 50, "x", "x".into()),
            Finding::new(Severity::Info, 10, "y", "y".into()),
        ])
        .unwrap();
        assert!(!calm.auto_contain);
    }

    #[test]
    fn test_benign_event_emits_nothing() {
        let mut e = engine(1000);
        let ev = Event::new(EventKind::Process, "start", "h")
            .with_process(ProcessInfo::new(10, "explorer.exe"));
        assert!(e.evaluate(&ev).is_empty());
    }

    #[test]
    fn test_partial_event_passes_through_as_info() {
        let mut e = engine(1000);
        let ev = Event::new(EventKind::Process, "start", "")
            .with_process(ProcessInfo::new(10, "explorer.exe"))
            .with_signal("partial", true);
        let alerts = e.evaluate(&ev);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Info);
        assert_eq!(e.stats().unscored, 1);
    }

    #[test]
    fn test_ids_increase() {
        let mut e = engine(1000);
        let mk = || Event::new(EventKind::Log, "vss_delete", "h");
        let a = e.evaluate(&mk());
        let b = e.evaluate(&mk());
        assert!(b[0].id > a[0].id);
    }

    #[test]
    fn test_apply_config_changes_threshold() {
        let mut e = engine(1000);
        let cfg = DetectionConfig {
            file_burst_threshold_per_sec: 5,
            watch_paths: vec![PathBuf::from("/w")],
            ..Default::default()
        };
        e.apply_config(&cfg);
        for i in 0..6u64 {
            let ev = Event::new(EventKind::File, "modify", "h")
                .with_path(PathBuf::from("/w/a"))
                .at(Timestamp::from_parts(i, Utc::now()));
            e.evaluate(&ev);
        }
        assert_eq!(e.drain().len(), 1);
    }
}
