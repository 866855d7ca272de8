//! External sensor feed
//!
//! Structured security-log and script-log readers run outside the agent
//! and stream `RawSensorEvent` records as JSON lines (a file, a pipe or
//! stdin). Each line goes through the same `SensorHandle` as the
//! built-in sensors.

use std::io::BufRead;
use std::sync::Arc;

use crate::logic::pipeline::SensorHandle;
use crate::logic::telemetry::normalizer::RawSensorEvent;

use super::StopSignal;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedStats {
    pub lines: u64,
    pub accepted: u64,
    pub unparsable: u64,
}

/// Read until EOF or stop; a bad line (including one that is not UTF-8)
/// is logged and skipped
pub fn pump<R: BufRead>(mut reader: R, handle: &SensorHandle, stop: &StopSignal, source: &str) -> FeedStats {
    let mut stats = FeedStats::default();
    let mut buf = Vec::new();
    while !stop.is_stopped() {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::warn!("[Sensors] Feed {} read error: {}", source, e);
                break;
            }
        }
        if buf.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        stats.lines += 1;
        match serde_json::from_slice::<RawSensorEvent>(&buf) {
            Ok(raw) => {
                if handle.submit(raw) {
                    stats.accepted += 1;
                }
            }
            Err(e) => {
                stats.unparsable += 1;
                log::warn!("[Normalizer] Feed {} line {} dropped: {}", source, stats.lines, e);
            }
        }
    }
    log::info!(
        "[Sensors] Feed {} finished: {} line(s), {} accepted, {} unparsable",
        source,
        stats.lines,
        stats.accepted,
        stats.unparsable
    );
    stats
}

/// Pump on a dedicated thread. Not joined at shutdown: a blocked read on
/// a pipe cannot be interrupted, and the pipeline stops independently.
pub fn spawn<R: BufRead + Send + 'static>(
    reader: R,
    handle: SensorHandle,
    stop: Arc<StopSignal>,
    source: String,
) -> std::io::Result<std::thread::JoinHandle<FeedStats>> {
    std::thread::Builder::new()
        .name("sensor-feed".into())
        .spawn(move || pump(reader, &handle, &stop, &source))
}
