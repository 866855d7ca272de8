//! Playbook Types
//!
//! Data structures only. Loading lives in `loader.rs`, matching and
//! execution in `engine.rs`.

use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::logic::detection::types::{Alert, Severity};
use crate::logic::telemetry::event::EventKind;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum PlaybookError {
    #[error("cannot read playbook source {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse playbook source {path:?}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("invalid playbook '{name}': {reason}")]
    Invalid { name: String, reason: String },
    #[error("duplicate playbook name '{0}'")]
    Duplicate(String),
}

// ============================================================================
// TRIGGERS
// ============================================================================

/// Predicates; a playbook matches when ALL present predicates hold
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Triggers {
    #[serde(deserialize_with = "deserialize_severity")]
    pub min_severity: Option<Severity>,
    pub min_score: Option<u8>,
    #[serde(alias = "type")]
    pub event_type: Option<EventKind>,
    #[serde(deserialize_with = "deserialize_one_or_many")]
    pub subtype: Vec<String>,
}

impl Triggers {
    pub fn matches(&self, alert: &Alert) -> bool {
        if let Some(min) = self.min_severity {
            if alert.severity < min {
                return false;
            }
        }
        if let Some(min) = self.min_score {
            if alert.score < min {
                return false;
            }
        }
        if let Some(kind) = self.event_type {
            if alert.event_ref.event_type != kind {
                return false;
            }
        }
        if !self.subtype.is_empty()
            && !self
                .subtype
                .iter()
                .any(|s| s.eq_ignore_ascii_case(&alert.event_ref.subtype))
        {
            return false;
        }
        true
    }
}

/// Severity as a name (`warning`, `CRITICAL`) or a level 1..=4
fn deserialize_severity<'de, D>(deserializer: D) -> Result<Option<Severity>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Name(String),
        Level(u8),
    }

    let raw = Option::<Raw>::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(Raw::Name(name)) => name.parse().map(Some).map_err(serde::de::Error::custom),
        Some(Raw::Level(level)) => match level {
            1 => Ok(Some(Severity::Info)),
            2 => Ok(Some(Severity::Warning)),
            3 => Ok(Some(Severity::Error)),
            4 => Ok(Some(Severity::Critical)),
            other => Err(serde::de::Error::custom(format!(
                "severity level {} out of range 1..=4",
                other
            ))),
        },
    }
}

fn deserialize_one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(Raw::One(s)) => vec![s],
        Some(Raw::Many(v)) => v,
    })
}

// ============================================================================
// ACTIONS
// ============================================================================

/// Closed set of response steps with typed parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionKind {
    /// Kill `pid`, or the alert's process when absent
    KillProcess {
        #[serde(default, alias = "target_pid")]
        pid: Option<u32>,
    },
    IsolateNetwork,
    /// Quarantine `path`, or the alert's path when absent
    QuarantineFile {
        #[serde(default)]
        path: Option<PathBuf>,
    },
    Notify {
        #[serde(default)]
        message: Option<String>,
    },
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::KillProcess { .. } => "kill_process",
            ActionKind::IsolateNetwork => "isolate_network",
            ActionKind::QuarantineFile { .. } => "quarantine_file",
            ActionKind::Notify { .. } => "notify",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    #[serde(flatten)]
    pub kind: ActionKind,
    /// Stop the rest of this playbook when this action fails
    #[serde(default)]
    pub abort_on_failure: bool,
}

impl ActionSpec {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            abort_on_failure: false,
        }
    }

    pub fn aborting(mut self) -> Self {
        self.abort_on_failure = true;
        self
    }
}

// ============================================================================
// PLAYBOOK
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Playbook {
    pub name: String,
    #[serde(default)]
    pub triggers: Triggers,
    pub actions: Vec<ActionSpec>,
}

impl Playbook {
    pub fn validate(&self) -> Result<(), PlaybookError> {
        let invalid = |reason: &str| PlaybookError::Invalid {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if self.actions.is_empty() {
            return Err(invalid("at least one action is required"));
        }
        if let Some(score) = self.triggers.min_score {
            if score > 100 {
                return Err(invalid("min_score must be within 0..=100"));
            }
        }
        if self.triggers.subtype.iter().any(|s| s.trim().is_empty()) {
            return Err(invalid("subtype filter must not be empty"));
        }
        for (idx, action) in self.actions.iter().enumerate() {
            match &action.kind {
                ActionKind::KillProcess { pid: Some(0) } => {
                    return Err(invalid(&format!("action {}: pid 0 is not a valid target", idx)));
                }
                ActionKind::QuarantineFile { path: Some(p) } if p.as_os_str().is_empty() => {
                    return Err(invalid(&format!("action {}: empty quarantine path", idx)));
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn matches(&self, alert: &Alert) -> bool {
        self.triggers.matches(alert)
    }
}

/// Shape of a playbook file: `playbooks: [...]`
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlaybookFile {
    #[serde(default)]
    pub playbooks: Vec<Playbook>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
name: contain-encryption
triggers:
  min_severity: critical
  min_score: 90
  type: file
  subtype: rename
actions:
  - kind: kill_process
  - kind: quarantine_file
    abort_on_failure: true
  - kind: isolate_network
  - kind: notify
    message: "host contained"
"#;

    #[test]
    fn test_parse_tagged_actions() {
        let pb: Playbook = serde_yaml::from_str(YAML).unwrap();
        assert_eq!(pb.triggers.min_severity, Some(Severity::Critical));
        assert_eq!(pb.triggers.event_type, Some(EventKind::File));
        assert_eq!(pb.triggers.subtype, vec!["rename".to_string()]);
        assert_eq!(pb.actions.len(), 4);
        assert_eq!(pb.actions[0].kind, ActionKind::KillProcess { pid: None });
        assert!(pb.actions[1].abort_on_failure);
        assert_eq!(pb.actions[2].kind, ActionKind::IsolateNetwork);
        assert!(pb.validate().is_ok());
    }

    #[test]
    fn test_numeric_severity_level() {
        let pb: Playbook = serde_yaml::from_str(
            "name: n\ntriggers: {min_severity: 2}\nactions: [{kind: notify}]",
        )
        .unwrap();
        assert_eq!(pb.triggers.min_severity, Some(Severity::Warning));
    }

    #[test]
    fn test_unknown_action_kind_rejected() {
        let res: Result<Playbook, _> =
            serde_yaml::from_str("name: n\nactions: [{kind: format_disk}]");
        assert!(res.is_err());
    }

    #[test]
    fn test_validate_rejects_empty_actions() {
        let pb = Playbook {
            name: "empty".into(),
            triggers: Triggers::default(),
            actions: vec![],
        };
        assert!(matches!(pb.validate(), Err(PlaybookError::Invalid { .. })));
    }
}
