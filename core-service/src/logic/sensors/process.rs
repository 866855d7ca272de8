//! Process-start sensor
//!
//! Polls the process table and reports pids that were not there on the
//! previous poll. The first poll only records a baseline.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use sysinfo::System;

use crate::logic::config::ConfigHandle;
use crate::logic::pipeline::SensorHandle;
use crate::logic::telemetry::normalizer::RawSensorEvent;

use super::StopSignal;

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSeen {
    pub pid: u32,
    pub parent_pid: Option<u32>,
    pub name: String,
    pub command_line: String,
}

/// Pid-set diff between polls
#[derive(Default)]
pub struct ProcessDiff {
    known: HashSet<u32>,
    primed: bool,
}

impl ProcessDiff {
    /// Processes new since the previous call; exited pids are forgotten so
    /// a reused pid is reported again
    pub fn update(&mut self, current: Vec<ProcessSeen>) -> Vec<ProcessSeen> {
        let pids: HashSet<u32> = current.iter().map(|p| p.pid).collect();
        let started = if self.primed {
            current
                .into_iter()
                .filter(|p| !self.known.contains(&p.pid))
                .collect()
        } else {
            self.primed = true;
            Vec::new()
        };
        self.known = pids;
        started
    }
}

fn snapshot(sys: &mut System, own_pid: u32) -> Vec<ProcessSeen> {
    sys.refresh_processes();
    sys.processes()
        .iter()
        .filter(|(pid, _)| pid.as_u32() != own_pid)
        .map(|(pid, process)| ProcessSeen {
            pid: pid.as_u32(),
            parent_pid: process.parent().map(|p| p.as_u32()),
            name: process.name().to_string(),
            command_line: process.cmd().join(" "),
        })
        .collect()
}

pub fn spawn(
    handle: SensorHandle,
    config: Arc<ConfigHandle>,
    stop: Arc<StopSignal>,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("sensor-process".into())
        .spawn(move || {
            let own_pid = std::process::id();
            let mut sys = System::new();
            let mut diff = ProcessDiff::default();
            loop {
                for p in diff.update(snapshot(&mut sys, own_pid)) {
                    handle.submit(RawSensorEvent::ProcessStart {
                        pid: p.pid,
                        parent_pid: p.parent_pid,
                        name: p.name,
                        command_line: p.command_line,
                        // Token elevation is not visible through the process table
                        elevated: false,
                    });
                }
                let poll_ms = config.current().config.detection.process_poll_ms.max(50);
                if stop.wait(Duration::from_millis(poll_ms)) {
                    break;
                }
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seen(pid: u32, name: &str) -> ProcessSeen {
        ProcessSeen {
            pid,
            parent_pid: None,
            name: name.into(),
            command_line: String::new(),
        }
    }

    #[test]
    fn test_first_poll_is_baseline() {
        let mut diff = ProcessDiff::default();
        assert!(diff.update(vec![seen(1, "init"), seen(2, "sshd")]).is_empty());
        let started = diff.update(vec![seen(1, "init"), seen(2, "sshd"), seen(3, "powershell.exe")]);
        assert_eq!(started, vec![seen(3, "powershell.exe")]);
    }

    #[test]
    fn test_reused_pid_is_reported_again() {
        let mut diff = ProcessDiff::default();
        diff.update(vec![seen(1, "init"), seen(9, "a")]);
        assert!(diff.update(vec![seen(1, "init")]).is_empty());
        assert_eq!(diff.update(vec![seen(1, "init"), seen(9, "b")]).len(), 1);
    }
}
