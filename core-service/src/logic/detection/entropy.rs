//! Entropy / Rename Detector
//!
//! Shannon entropy over up to three 64 KiB samples (head, middle, tail).
//! Encrypted output sits near 8 bits/byte on every sample; compressed
//! formats often have a low-entropy header, which is why the minimum
//! sample is checked as well as the average.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::logic::telemetry::event::{Event, EventKind};

use super::types::{Finding, Severity};

/// Bytes per sample
pub const SAMPLE_SIZE: usize = 64 * 1024;

/// Extensions used by WannaCry
const WANNACRY_EXTENSIONS: &[&str] = &[".wnry", ".wncry", ".wcry"];

/// Shannon entropy in bits per byte (0.0 ..= 8.0)
pub fn shannon_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let mut counts = [0u64; 256];
    for &b in data {
        counts[b as usize] += 1;
    }
    let len = data.len() as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / len;
            -p * p.log2()
        })
        .sum()
}

/// Average and minimum entropy across samples
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntropyReading {
    pub average: f64,
    pub minimum: f64,
    pub samples: usize,
}

impl EntropyReading {
    pub fn from_samples(samples: &[Vec<u8>]) -> Option<Self> {
        let values: Vec<f64> = samples
            .iter()
            .filter(|s| !s.is_empty())
            .map(|s| shannon_entropy(s))
            .collect();
        if values.is_empty() {
            return None;
        }
        let average = values.iter().sum::<f64>() / values.len() as f64;
        let minimum = values.iter().cloned().fold(f64::INFINITY, f64::min);
        Some(Self {
            average,
            minimum,
            samples: values.len(),
        })
    }

    /// Split an in-memory buffer into head/middle/tail samples
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        Self::from_samples(&split_samples(data))
    }
}

/// Start of each full-size sample window: head and tail, plus the middle
/// once there is room for three disjoint windows
fn sample_offsets(len: u64) -> Vec<u64> {
    let size = SAMPLE_SIZE as u64;
    if len <= size {
        vec![0]
    } else if len <= size * 3 {
        vec![0, len - size]
    } else {
        vec![0, len / 2 - size / 2, len - size]
    }
}

fn split_samples(data: &[u8]) -> Vec<Vec<u8>> {
    sample_offsets(data.len() as u64)
        .into_iter()
        .map(|offset| {
            let start = offset as usize;
            let end = (start + SAMPLE_SIZE).min(data.len());
            data[start..end].to_vec()
        })
        .collect()
}

/// Read head, middle and tail samples from a file (bounded I/O)
pub fn sample_file(path: &Path) -> std::io::Result<Vec<Vec<u8>>> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let offsets = sample_offsets(len);

    let mut samples = Vec::with_capacity(offsets.len());
    for offset in offsets {
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity(SAMPLE_SIZE);
        (&mut file).take(SAMPLE_SIZE as u64).read_to_end(&mut buf)?;
        samples.push(buf);
    }
    Ok(samples)
}

// ============================================================================
// DETECTOR
// ============================================================================

pub struct EntropyDetector {
    average_threshold: f64,
    min_sample_threshold: f64,
    watchlist: Vec<String>,
}

impl EntropyDetector {
    pub fn new(average_threshold: f64, min_sample_threshold: f64, watchlist: Vec<String>) -> Self {
        Self {
            average_threshold,
            min_sample_threshold,
            watchlist,
        }
    }

    pub fn is_suspicious(&self, reading: &EntropyReading) -> bool {
        reading.average > self.average_threshold && reading.minimum > self.min_sample_threshold
    }

    fn watchlisted(&self, ext: &str) -> bool {
        self.watchlist.iter().any(|w| w == ext)
    }

    /// Score a rename
    pub fn evaluate(&self, event: &Event) -> Option<Finding> {
        if event.kind != EventKind::File || event.subtype != "rename" {
            return None;
        }
        let ext = event.extension_lower()?;
        let watchlisted = self.watchlisted(&ext);
        let wannacry = WANNACRY_EXTENSIONS.contains(&ext.as_str());

        let reading = match (event.signal_f64("entropy"), event.signal_f64("entropy_min")) {
            (Some(average), Some(minimum)) => Some(EntropyReading {
                average,
                minimum,
                samples: event.signal_f64("entropy_samples").unwrap_or(1.0) as usize,
            }),
            (Some(average), None) => Some(EntropyReading {
                average,
                minimum: average,
                samples: 1,
            }),
            _ => None,
        };

        let finding = match reading {
            Some(r) if watchlisted && self.is_suspicious(&r) => {
                // 90 at the threshold, 100 at 8 bits/byte
                let span = (8.0 - self.average_threshold).max(f64::EPSILON);
                let extra = ((r.average - self.average_threshold) / span * 10.0).clamp(0.0, 10.0);
                Finding::new(
                    Severity::Critical,
                    90 + extra.round() as u8,
                    "encrypted_rename",
                    format!(
                        "Renamed to watch-listed extension {} with encrypted-looking content (entropy {:.2}, min {:.2})",
                        ext, r.average, r.minimum
                    ),
                )
                .indicator("entropy")
                .indicator("ransomware_extension")
                .contain()
            }
            Some(r) if watchlisted => Finding::new(
                Severity::Warning,
                60,
                "suspicious_extension",
                format!(
                    "Renamed to watch-listed extension {} (entropy {:.2} below threshold)",
                    ext, r.average
                ),
            )
            .indicator("ransomware_extension"),
            Some(r) if self.is_suspicious(&r) => Finding::new(
                Severity::Warning,
                50,
                "high_entropy_rename",
                format!("Rename produced encrypted-looking content (entropy {:.2})", r.average),
            )
            .indicator("entropy"),
            None if watchlisted => Finding::new(
                Severity::Warning,
                60,
                "suspicious_extension",
                format!("Renamed to watch-listed extension {} (content unreadable)", ext),
            )
            .indicator("ransomware_extension"),
            _ => return None,
        };

        let finding = match reading {
            Some(r) => finding
                .signal("entropy", r.average)
                .signal("entropy_min", r.minimum),
            None => finding,
        };
        Some(if wannacry { finding.indicator("wannacry") } else { finding })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn detector() -> EntropyDetector {
        EntropyDetector::new(7.3, 7.0, vec![".locked".into(), ".wncry".into()])
    }

    fn random_bytes(n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        rand::thread_rng().fill_bytes(&mut buf);
        buf
    }

    fn rename_with(reading: EntropyReading, to: &str) -> Event {
        Event::new(EventKind::File, "rename", "h")
            .with_path(PathBuf::from(to))
            .with_signal("entropy", reading.average)
            .with_signal("entropy_min", reading.minimum)
    }

    #[test]
    fn test_entropy_bounds() {
        assert_eq!(shannon_entropy(&[]), 0.0);
        assert_eq!(shannon_entropy(&[0u8; 4096]), 0.0);
        let all: Vec<u8> = (0..=255u8).collect();
        assert!((shannon_entropy(&all) - 8.0).abs() < 1e-9);
        assert!(shannon_entropy(&random_bytes(SAMPLE_SIZE)) > 7.9);
    }

    #[test]
    fn test_random_content_is_critical() {
        let reading = EntropyReading::from_bytes(&random_bytes(SAMPLE_SIZE * 4)).unwrap();
        assert_eq!(reading.samples, 3);
        let finding = detector()
            .evaluate(&rename_with(reading, "/d/report.docx.locked"))
            .unwrap();
        assert_eq!(finding.severity, Severity::Critical);
        assert!(finding.score >= 90 && finding.score <= 100);
        assert!(finding.auto_contain);
    }

    #[test]
    fn test_just_over_one_window_is_critical() {
        let reading = EntropyReading::from_bytes(&random_bytes(SAMPLE_SIZE + 1)).unwrap();
        assert_eq!(reading.samples, 2);
        assert!(reading.minimum > 7.9);
        let finding = detector()
            .evaluate(&rename_with(reading, "/d/report.docx.locked"))
            .unwrap();
        assert_eq!(finding.severity, Severity::Critical);
    }

    #[test]
    fn test_only_renames_are_scored() {
        let reading = EntropyReading::from_bytes(&random_bytes(SAMPLE_SIZE)).unwrap();
        let event = Event::new(EventKind::File, "modify", "h")
            .with_path(PathBuf::from("/d/report.docx.locked"))
            .with_signal("entropy", reading.average)
            .with_signal("entropy_min", reading.minimum);
        assert!(detector().evaluate(&event).is_none());
    }

    #[test]
    fn test_zero_content_stays_warning() {
        let reading = EntropyReading::from_bytes(&vec![0u8; SAMPLE_SIZE * 4]).unwrap();
        let finding = detector()
            .evaluate(&rename_with(reading, "/d/report.docx.locked"))
            .unwrap();
        assert!(finding.severity <= Severity::Warning);
        assert!(!finding.auto_contain);
    }

    #[test]
    fn test_unlisted_extension_not_critical() {
        let reading = EntropyReading::from_bytes(&random_bytes(SAMPLE_SIZE)).unwrap();
        let finding = detector().evaluate(&rename_with(reading, "/d/archive.zip")).unwrap();
        assert_eq!(finding.severity, Severity::Warning);
    }

    #[test]
    fn test_wannacry_extension_tagged() {
        let reading = EntropyReading::from_bytes(&random_bytes(SAMPLE_SIZE)).unwrap();
        let finding = detector().evaluate(&rename_with(reading, "/d/a.pdf.WNCRY")).unwrap();
        assert!(finding.indicators.contains(&"wannacry".to_string()));
    }

    #[test]
    fn test_sample_file_reads_three_windows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.bin");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&random_bytes(SAMPLE_SIZE * 5)).unwrap();
        drop(f);

        let samples = sample_file(&path).unwrap();
        assert_eq!(samples.len(), 3);
        assert!(samples.iter().all(|s| s.len() == SAMPLE_SIZE));
    }

    #[test]
    fn test_sample_small_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("small.txt");
        std::fs::write(&path, b"hello").unwrap();
        let samples = sample_file(&path).unwrap();
        assert_eq!(samples, vec![b"hello".to_vec()]);
    }
}
