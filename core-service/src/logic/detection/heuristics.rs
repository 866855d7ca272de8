//! Heuristic / Keyword Detector
//!
//! Fixed lookup table over process, log, script, file-name and resource
//! events.
//!
//! | Match                                            | Severity | Score |
//! |--------------------------------------------------|----------|-------|
//! | Known WannaCry binary started                    | CRITICAL | 90    |
//! | Ransom note file written                         | ERROR    | 85    |
//! | Shadow copy / backup destruction command         | ERROR    | 80    |
//! | Log: VSS delete                                  | ERROR    | 80    |
//! | LOLBin + encoded/obfuscated command              | ERROR    | 70    |
//! | LOLBin + other suspicious keyword                | WARNING  | 55    |
//! | Log: service install                             | WARNING  | 55    |
//! | Script / script-block with suspicious keywords   | WARNING  | 50    |
//! | Resource usage above threshold                   | WARNING  | 40    |

use once_cell::sync::Lazy;
use regex::Regex;

use crate::logic::telemetry::event::{Event, EventKind};

use super::types::{Finding, Severity};

// ============================================================================
// TABLES
// ============================================================================

/// Script interpreters abused as living-off-the-land binaries
pub const LOLBINS: &[&str] = &["powershell", "pwsh", "wscript", "cscript", "cmd", "mshta"];

/// Encoded / obfuscated command markers
const ENCODED_KEYWORDS: &[&str] = &["encodedcommand", "frombase64", "invoke-expression"];

/// Weaker markers that alone only warrant a warning. Matched as whole
/// words so `iex` does not fire on `complex`.
const SUSPICIOUS_KEYWORDS: &[&str] = &[
    "iex",
    "downloadstring",
    "downloadfile",
    "invoke-webrequest",
    "-windowstyle hidden",
    "-w hidden",
    "bypass",
    "-nop",
    "bitsadmin",
    "certutil",
];

/// WannaCry dropper and helpers
const WANNACRY_BINARIES: &[&str] = &["mssecsvc", "tasksche", "taskdl", "taskse"];

/// Shadow copy / backup destruction command fragments
const SHADOW_DELETION: &[&str] = &[
    "vssadmin delete shadows",
    "vssadmin.exe delete shadows",
    "vssadmin resize shadowstorage",
    "wmic shadowcopy delete",
    "wbadmin delete catalog",
    "wbadmin delete systemstatebackup",
    "recoveryenabled no",
    "bootstatuspolicy ignoreallfailures",
    "win32_shadowcopy",
];

/// `-e`, `-ec`, `-enc`, `-encodedcommand` (and `/` forms) as standalone switches
static ENCODED_SWITCH: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"(?i)(?:^|\s)[-/]e(?:c|n|nc|nco|ncod|ncode|ncoded|ncodedc|ncodedcommand)?(?:\s|$)").ok()
});

static SUSPICIOUS_WORDS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    SUSPICIOUS_KEYWORDS
        .iter()
        .filter_map(|k| {
            let pattern = format!(r"(?:^|[^\w-]){}(?:$|[^\w-])", regex::escape(k));
            Regex::new(&pattern).ok().map(|re| (*k, re))
        })
        .collect()
});

/// Collapse runs of whitespace so `vssadmin  delete   shadows` still matches
fn squash(text: &str) -> String {
    text.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

fn hits(text: &str, table: &[&str]) -> Vec<String> {
    table
        .iter()
        .filter(|k| text.contains(*k))
        .map(|k| k.to_string())
        .collect()
}

fn suspicious_hits(text: &str) -> Vec<String> {
    SUSPICIOUS_WORDS
        .iter()
        .filter(|(_, re)| re.is_match(text))
        .map(|(k, _)| k.to_string())
        .collect()
}

fn has_encoded_switch(cmdline: &str) -> bool {
    ENCODED_SWITCH
        .as_ref()
        .map(|re| re.is_match(cmdline))
        .unwrap_or(false)
}

// ============================================================================
// DETECTOR
// ============================================================================

pub struct HeuristicDetector {
    ransom_notes: Vec<String>,
    cpu_threshold: f32,
    io_threshold: u64,
}

impl HeuristicDetector {
    pub fn new(ransom_notes: &[String], cpu_threshold: f32, io_threshold: u64) -> Self {
        Self {
            ransom_notes: ransom_notes.iter().map(|n| n.to_lowercase()).collect(),
            cpu_threshold,
            io_threshold,
        }
    }

    /// All table rows that fire for this event
    pub fn evaluate(&self, event: &Event) -> Vec<Finding> {
        match event.kind {
            EventKind::Process => self.process(event),
            EventKind::Log => self.log(event),
            EventKind::Script => self.script(event),
            EventKind::File => self.file(event).into_iter().collect(),
            EventKind::Resource => self.resource(event).into_iter().collect(),
        }
    }

    fn process(&self, event: &Event) -> Vec<Finding> {
        let Some(process) = &event.process else {
            return Vec::new();
        };
        let stem = process.image_stem();
        let cmd = squash(&process.command_line);
        let mut findings = Vec::new();

        if WANNACRY_BINARIES.contains(&stem.as_str()) {
            findings.push(
                Finding::new(
                    Severity::Critical,
                    90,
                    "wannacry_binary",
                    format!("Known WannaCry component started: {} (pid {})", process.name, process.pid),
                )
                .indicator("wannacry"),
            );
        }

        let shadow = hits(&cmd, SHADOW_DELETION);
        if !shadow.is_empty() {
            findings.push(
                Finding::new(
                    Severity::Error,
                    80,
                    "shadow_copy_deletion",
                    format!("Backup/shadow copy destruction by {} (pid {})", process.name, process.pid),
                )
                .indicator("shadow_delete")
                .signal("keyword_hits", shadow),
            );
        }

        if LOLBINS.contains(&stem.as_str()) {
            let mut encoded = hits(&cmd, ENCODED_KEYWORDS);
            if has_encoded_switch(&cmd) {
                encoded.push("-enc".to_string());
            }
            let weak = suspicious_hits(&cmd);

            if !encoded.is_empty() {
                findings.push(
                    Finding::new(
                        Severity::Error,
                        70,
                        "lolbin_encoded_command",
                        format!("{} started with an encoded/obfuscated command (pid {})", stem, process.pid),
                    )
                    .indicator("lolbin")
                    .indicator("encoded_command")
                    .signal("keyword_hits", encoded),
                );
            } else if !weak.is_empty() {
                findings.push(
                    Finding::new(
                        Severity::Warning,
                        55,
                        "lolbin_suspicious_command",
                        format!("{} started with suspicious arguments (pid {})", stem, process.pid),
                    )
                    .indicator("lolbin")
                    .signal("keyword_hits", weak),
                );
            }
        }

        findings
    }

    fn log(&self, event: &Event) -> Vec<Finding> {
        let text = squash(event.signal_str("message").unwrap_or_default());
        let mut findings = Vec::new();

        match event.subtype.as_str() {
            "vss_delete" => findings.push(
                Finding::new(
                    Severity::Error,
                    80,
                    "vss_delete",
                    "Security log reports shadow copy deletion".to_string(),
                )
                .indicator("shadow_delete"),
            ),
            "service_install" => findings.push(
                Finding::new(
                    Severity::Warning,
                    55,
                    "service_install",
                    "New service installed".to_string(),
                )
                .indicator("persistence"),
            ),
            "ps_scriptblock" => findings.extend(self.script_text(&text)),
            _ => {
                let shadow = hits(&text, SHADOW_DELETION);
                if !shadow.is_empty() {
                    findings.push(
                        Finding::new(
                            Severity::Error,
                            80,
                            "shadow_copy_deletion",
                            "Security log contains backup destruction command".to_string(),
                        )
                        .indicator("shadow_delete")
                        .signal("keyword_hits", shadow),
                    );
                }
            }
        }

        // Process-create records carry a command line worth the process rules
        if event.process.is_some() && event.subtype == "sysmon_process_create" {
            findings.extend(self.process(event));
        }
        findings
    }

    fn script(&self, event: &Event) -> Vec<Finding> {
        let text = squash(event.signal_str("script_text").unwrap_or_default());
        self.script_text(&text).into_iter().collect()
    }

    fn script_text(&self, text: &str) -> Option<Finding> {
        let mut keywords = hits(text, ENCODED_KEYWORDS);
        keywords.extend(suspicious_hits(text));
        keywords.extend(hits(text, SHADOW_DELETION));
        if keywords.is_empty() {
            return None;
        }
        Some(
            Finding::new(
                Severity::Warning,
                50,
                "suspicious_script",
                format!("Script content matched {} suspicious keyword(s)", keywords.len()),
            )
            .indicator("script")
            .signal("keyword_hits", keywords),
        )
    }

    fn file(&self, event: &Event) -> Option<Finding> {
        if !matches!(event.subtype.as_str(), "create" | "modify" | "write" | "rename") {
            return None;
        }
        let name = event.file_name_lower()?;
        if !self.ransom_notes.contains(&name) {
            return None;
        }
        Some(
            Finding::new(
                Severity::Error,
                85,
                "ransom_note",
                format!("Ransom note written: {}", name),
            )
            .indicator("ransom_note"),
        )
    }

    fn resource(&self, event: &Event) -> Option<Finding> {
        let (value, threshold, label) = match event.subtype.as_str() {
            "high_cpu" => (
                event.signal_f64("cpu_percent")?,
                self.cpu_threshold as f64,
                "CPU %",
            ),
            "high_disk_write" => (
                event.signal_f64("disk_write_bytes")?,
                self.io_threshold as f64,
                "disk write bytes/s",
            ),
            _ => return None,
        };
        if value < threshold {
            return None;
        }
        let who = event
            .process
            .as_ref()
            .map(|p| format!("{} (pid {})", p.name, p.pid))
            .unwrap_or_else(|| "unknown process".to_string());
        Some(
            Finding::new(
                Severity::Warning,
                40,
                &format!("resource_{}", event.subtype),
                format!("{} exceeded {} threshold: {:.0} >= {:.0}", who, label, value, threshold),
            )
            .indicator("resource"),
        )
    }
}
