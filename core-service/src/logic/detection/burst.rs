//! Burst Detector
//!
//! Counts file-write events per watch path in tumbling 1-second windows.
//! A window is anchored at its first event and closed either by the next
//! event on that path arriving after the window, or by `flush`. Closing
//! an over-threshold window yields exactly one finding carrying the full
//! window count.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::logic::telemetry::event::{Event, EventKind, EventSummary};

use super::types::{Finding, Severity};

/// Window length
pub const WINDOW_NS: u64 = 1_000_000_000;

/// File subtypes that count as writes
const WRITE_SUBTYPES: &[&str] = &["create", "modify", "write", "rename"];

struct Window {
    start_ns: u64,
    count: u32,
    last_event: EventSummary,
}

/// A closed over-threshold window
#[derive(Debug, Clone)]
pub struct BurstHit {
    pub watch_path: PathBuf,
    pub count: u32,
    pub event_ref: EventSummary,
    pub finding: Finding,
}

pub struct BurstDetector {
    threshold: u32,
    watch_paths: Vec<PathBuf>,
    windows: HashMap<PathBuf, Window>,
}

impl BurstDetector {
    pub fn new(threshold: u32, watch_paths: Vec<PathBuf>) -> Self {
        Self {
            threshold: threshold.max(1),
            watch_paths,
            windows: HashMap::new(),
        }
    }

    /// Pick up new thresholds; open windows keep counting
    pub fn reconfigure(&mut self, threshold: u32, watch_paths: Vec<PathBuf>) {
        self.threshold = threshold.max(1);
        self.watch_paths = watch_paths;
    }

    /// `score = min(100, 50 + (count/threshold)*10)`
    pub fn score(count: u32, threshold: u32) -> u8 {
        let ratio = count as f64 / threshold.max(1) as f64;
        (50.0 + ratio * 10.0).min(100.0).floor() as u8
    }

    /// Longest configured watch path containing `path`, else its parent
    fn window_key(&self, path: &Path) -> PathBuf {
        self.watch_paths
            .iter()
            .filter(|w| path.starts_with(w))
            .max_by_key(|w| w.as_os_str().len())
            .cloned()
            .unwrap_or_else(|| path.parent().unwrap_or(path).to_path_buf())
    }

    fn is_write(event: &Event) -> bool {
        event.kind == EventKind::File && WRITE_SUBTYPES.contains(&event.subtype.as_str())
    }

    /// Count one event; returns the hit of a window it closed, if any
    pub fn observe(&mut self, event: &Event) -> Option<BurstHit> {
        if !Self::is_write(event) {
            return None;
        }
        let path = event.path.as_ref()?;
        let key = self.window_key(path);
        let now = event.timestamp.mono_ns;

        let mut closed = None;
        if let Some(window) = self.windows.get(&key) {
            if now.saturating_sub(window.start_ns) >= WINDOW_NS {
                if let Some(old) = self.windows.remove(&key) {
                    closed = self.close(key.clone(), old);
                }
            }
        }

        let window = self.windows.entry(key).or_insert_with(|| Window {
            start_ns: now,
            count: 0,
            last_event: event.summary(),
        });
        window.count += 1;
        window.last_event = event.summary();

        closed
    }

    /// Close every window that ended before `now_ns`
    pub fn flush(&mut self, now_ns: u64) -> Vec<BurstHit> {
        let expired: Vec<PathBuf> = self
            .windows
            .iter()
            .filter(|(_, w)| now_ns.saturating_sub(w.start_ns) >= WINDOW_NS)
            .map(|(k, _)| k.clone())
            .collect();

        let mut hits: Vec<BurstHit> = expired
            .into_iter()
            .filter_map(|key| {
                let window = self.windows.remove(&key)?;
                self.close(key, window)
            })
            .collect();
        hits.sort_by_key(|h| h.event_ref.mono_ns);
        hits
    }

    /// Close all windows regardless of age (shutdown)
    pub fn drain(&mut self) -> Vec<BurstHit> {
        self.flush(u64::MAX)
    }

    pub fn open_windows(&self) -> usize {
        self.windows.len()
    }

    fn close(&self, key: PathBuf, window: Window) -> Option<BurstHit> {
        if window.count <= self.threshold {
            return None;
        }
        let score = Self::score(window.count, self.threshold);
        let finding = Finding::new(
            Severity::Warning,
            score,
            "file_burst",
            format!(
                "{} file writes in 1s under {} (threshold {}/s)",
                window.count,
                key.display(),
                self.threshold
            ),
        )
        .indicator("burst")
        .signal("burst_count", window.count)
        .signal("burst_threshold", self.threshold)
        .signal("watch_path", key.to_string_lossy().to_string());

        Some(BurstHit {
            watch_path: key,
            count: window.count,
            event_ref: window.last_event,
            finding,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::telemetry::event::Timestamp;
    use chrono::Utc;

    fn write_at(path: &str, mono_ns: u64) -> Event {
        Event::new(EventKind::File, "create", "h")
            .with_path(PathBuf::from(path))
            .at(Timestamp::from_parts(mono_ns, Utc::now()))
    }

    fn detector() -> BurstDetector {
        BurstDetector::new(120, vec![PathBuf::from("/home/u/Desktop")])
    }

    #[test]
    fn test_one_alert_per_window() {
        let mut d = detector();
        for i in 0..250u64 {
            let e = write_at(&format!("/home/u/Desktop/f{}.txt", i), i * 3_000_000);
            assert!(d.observe(&e).is_none());
        }
        let hits = d.flush(2 * WINDOW_NS);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].count, 250);
        assert_eq!(hits[0].finding.severity, Severity::Warning);
        assert!(hits[0].finding.score >= 60);
        assert!(d.flush(3 * WINDOW_NS).is_empty());
        assert_eq!(d.open_windows(), 0);
    }

    #[test]
    fn test_next_event_closes_window() {
        let mut d = detector();
        for i in 0..130u64 {
            d.observe(&write_at("/home/u/Desktop/a.txt", i * 1_000_000));
        }
        let hit = d.observe(&write_at("/home/u/Desktop/b.txt", WINDOW_NS + 5));
        assert_eq!(hit.map(|h| h.count), Some(130));
        // The new window holds only the closing event
        assert!(d.flush(3 * WINDOW_NS).is_empty());
    }

    #[test]
    fn test_under_threshold_is_silent() {
        let mut d = detector();
        for i in 0..120u64 {
            d.observe(&write_at("/home/u/Desktop/a.txt", i));
        }
        assert!(d.flush(2 * WINDOW_NS).is_empty());
    }

    #[test]
    fn test_score_monotonic_in_count() {
        let mut last = 0;
        for count in 121..2000 {
            let s = BurstDetector::score(count, 120);
            assert!(s >= last);
            last = s;
        }
        assert_eq!(BurstDetector::score(250, 120), 70);
        assert_eq!(BurstDetector::score(100_000, 120), 100);
    }

    #[test]
    fn test_paths_are_independent() {
        let mut d = BurstDetector::new(10, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
        for i in 0..11u64 {
            d.observe(&write_at("/a/x", i));
            d.observe(&write_at("/b/y", i));
        }
        let hits = d.flush(WINDOW_NS * 2);
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_non_write_events_ignored() {
        let mut d = detector();
        let e = Event::new(EventKind::File, "delete", "h").with_path(PathBuf::from("/home/u/Desktop/a"));
        assert!(d.observe(&e).is_none());
        assert_eq!(d.open_windows(), 0);
    }
}
