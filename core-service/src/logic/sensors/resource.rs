//! Resource sensor
//!
//! Samples per-process CPU% and bytes written every
//! `resource_interval_secs`; reports readings above the configured
//! thresholds. A process is reported at most once per metric per
//! cooldown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sysinfo::System;

use crate::logic::config::ConfigHandle;
use crate::logic::pipeline::SensorHandle;
use crate::logic::telemetry::normalizer::{RawSensorEvent, ResourceMetric};

use super::StopSignal;

const REPORT_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSample {
    pub pid: u32,
    pub name: String,
    pub cpu_percent: f32,
    /// Written since the previous sample
    pub written_bytes: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub cpu_percent: f32,
    pub write_bytes_per_sec: u64,
}

#[derive(Default)]
pub struct ResourceFilter {
    last_report: HashMap<(u32, ResourceMetric), Instant>,
}

impl ResourceFilter {
    pub fn new() -> Self {
        Self::default()
    }

    fn cooled_down(&mut self, key: (u32, ResourceMetric), now: Instant) -> bool {
        match self.last_report.get(&key) {
            Some(at) if now.duration_since(*at) < REPORT_COOLDOWN => false,
            _ => {
                self.last_report.insert(key, now);
                true
            }
        }
    }

    /// Readings over threshold, as raw records
    pub fn evaluate(
        &mut self,
        samples: &[ResourceSample],
        limits: Thresholds,
        interval: Duration,
        now: Instant,
    ) -> Vec<RawSensorEvent> {
        let secs = interval.as_secs_f64().max(1.0);
        let mut out = Vec::new();
        for s in samples {
            if s.cpu_percent > limits.cpu_percent && self.cooled_down((s.pid, ResourceMetric::Cpu), now) {
                out.push(RawSensorEvent::Resource {
                    metric: ResourceMetric::Cpu,
                    pid: s.pid,
                    name: s.name.clone(),
                    value: s.cpu_percent as f64,
                });
            }
            let rate = s.written_bytes as f64 / secs;
            if rate > limits.write_bytes_per_sec as f64
                && self.cooled_down((s.pid, ResourceMetric::DiskWrite), now)
            {
                out.push(RawSensorEvent::Resource {
                    metric: ResourceMetric::DiskWrite,
                    pid: s.pid,
                    name: s.name.clone(),
                    value: rate,
                });
            }
        }
        self.last_report
            .retain(|_, at| now.duration_since(*at) < REPORT_COOLDOWN);
        out
    }
}

fn sample(sys: &mut System, own_pid: u32) -> Vec<ResourceSample> {
    sys.refresh_processes();
    sys.processes()
        .iter()
        .filter(|(pid, _)| pid.as_u32() != own_pid)
        .map(|(pid, p)| ResourceSample {
            pid: pid.as_u32(),
            name: p.name().to_string(),
            cpu_percent: p.cpu_usage(),
            written_bytes: p.disk_usage().written_bytes,
        })
        .collect()
}

pub fn spawn(
    handle: SensorHandle,
    config: Arc<ConfigHandle>,
    stop: Arc<StopSignal>,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("sensor-resource".into())
        .spawn(move || {
            let own_pid = std::process::id();
            let mut sys = System::new();
            let mut filter = ResourceFilter::new();
            // CPU usage is a delta between refreshes; the first sample is a baseline
            sample(&mut sys, own_pid);
            loop {
                let detection = config.current().config.detection.clone();
                let interval = Duration::from_secs(detection.resource_interval_secs.max(1));
                if stop.wait(interval) {
                    break;
                }
                let limits = Thresholds {
                    cpu_percent: detection.cpu_usage_threshold,
                    write_bytes_per_sec: detection.io_write_threshold_bytes,
                };
                let samples = sample(&mut sys, own_pid);
                for raw in filter.evaluate(&samples, limits, interval, Instant::now()) {
                    handle.submit(raw);
                }
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: Thresholds = Thresholds {
        cpu_percent: 80.0,
        write_bytes_per_sec: 1_000,
    };

    fn s(pid: u32, cpu: f32, written: u64) -> ResourceSample {
        ResourceSample {
            pid,
            name: format!("p{}", pid),
            cpu_percent: cpu,
            written_bytes: written,
        }
    }

    #[test]
    fn test_thresholds_per_metric() {
        let mut f = ResourceFilter::new();
        let out = f.evaluate(
            &[s(1, 95.0, 0), s(2, 10.0, 50_000), s(3, 10.0, 10)],
            LIMITS,
            Duration::from_secs(5),
            Instant::now(),
        );
        assert_eq!(out.len(), 2);
        assert!(matches!(out[0], RawSensorEvent::Resource { metric: ResourceMetric::Cpu, pid: 1, .. }));
        match &out[1] {
            RawSensorEvent::Resource { metric, value, .. } => {
                assert_eq!(*metric, ResourceMetric::DiskWrite);
                assert_eq!(*value, 10_000.0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_cooldown_suppresses_repeats() {
        let mut f = ResourceFilter::new();
        let t0 = Instant::now();
        let hot = [s(1, 99.0, 0)];
        assert_eq!(f.evaluate(&hot, LIMITS, Duration::from_secs(5), t0).len(), 1);
        assert!(f.evaluate(&hot, LIMITS, Duration::from_secs(5), t0 + Duration::from_secs(5)).is_empty());
        let later = t0 + REPORT_COOLDOWN + Duration::from_secs(1);
        assert_eq!(f.evaluate(&hot, LIMITS, Duration::from_secs(5), later).len(), 1);
    }
}
