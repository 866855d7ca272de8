//! Config Loader
//!
//! YAML file -> validated `ConfigSnapshot`. Secrets come from the
//! environment variables the file names, never from the file itself.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::logic::playbook::loader::load_playbooks;
use crate::logic::playbook::types::{Playbook, PlaybookError};

use super::types::{AgentConfig, OutboundMode};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config {path:?}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("secret missing: environment variable {0} is unset or empty")]
    MissingSecret(String),
    #[error(transparent)]
    Playbook(#[from] PlaybookError),
    #[error("config watcher: {0}")]
    Watch(String),
}

/// Everything a worker needs from one config generation
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub config: AgentConfig,
    /// Load order = evaluation order
    pub playbooks: Arc<Vec<Playbook>>,
    pub hmac_key: Vec<u8>,
    pub mqtt_password: Option<String>,
    pub generation: u64,
}

// ============================================================================
// PARSE + VALIDATE
// ============================================================================

pub fn parse_config(path: &Path, text: &str) -> Result<AgentConfig, ConfigError> {
    serde_yaml::from_str(text).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

pub fn read_config(path: &Path) -> Result<AgentConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    parse_config(path, &text)
}

/// Structural checks; playbooks are validated by their loader
pub fn validate(cfg: &AgentConfig) -> Result<(), ConfigError> {
    let invalid = |msg: String| Err(ConfigError::Invalid(msg));
    let d = &cfg.detection;

    if d.file_burst_threshold_per_sec == 0 {
        return invalid("detection.file_burst_threshold_per_sec must be > 0".into());
    }
    if d.cpu_usage_threshold <= 0.0 {
        return invalid("detection.cpu_usage_threshold must be > 0".into());
    }
    if d.io_write_threshold_bytes == 0 {
        return invalid("detection.io_write_threshold_bytes must be > 0".into());
    }
    for (name, value) in [
        ("entropy_threshold", d.entropy_threshold),
        ("entropy_min_sample_threshold", d.entropy_min_sample_threshold),
    ] {
        if value <= 0.0 || value > 8.0 {
            return invalid(format!("detection.{} must be within (0, 8]", name));
        }
    }
    if d.watch_paths.is_empty() {
        return invalid("detection.watch_paths needs at least one path".into());
    }
    if d.ext_watchlist.iter().any(|e| e.trim().trim_start_matches('.').is_empty()) {
        return invalid("detection.ext_watchlist contains an empty extension".into());
    }

    match cfg.outbound.mode {
        OutboundMode::Mqtt => {
            if cfg.outbound.mqtt.host.trim().is_empty() {
                return invalid("outbound.mqtt.host is required in mqtt mode".into());
            }
            if cfg.outbound.mqtt.topic.trim().is_empty() {
                return invalid("outbound.mqtt.topic must not be empty".into());
            }
        }
        OutboundMode::Https => {
            let url = cfg.outbound.https.url.trim();
            if url.is_empty() {
                return invalid("outbound.https.url is required in https mode".into());
            }
            if !url.starts_with("https://") && !url.starts_with("http://") {
                return invalid(format!("outbound.https.url is not an http(s) URL: {}", url));
            }
            if url.starts_with("http://") {
                log::warn!("[Config] outbound.https.url is plain http; use only for local testing");
            }
        }
    }

    let r = &cfg.outbound.retry;
    if r.base_delay_ms == 0 || r.max_delay_ms < r.base_delay_ms {
        return invalid("outbound.retry needs 0 < base_delay_ms <= max_delay_ms".into());
    }
    if r.max_retries == 0 {
        return invalid("outbound.retry.max_retries must be > 0".into());
    }
    if cfg.security.hmac_key_env.trim().is_empty() {
        return invalid("security.hmac_key_env must name an environment variable".into());
    }
    Ok(())
}

fn read_secret(var: &str) -> Result<String, ConfigError> {
    match std::env::var(var) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::MissingSecret(var.to_string())),
    }
}

// ============================================================================
// SNAPSHOTS
// ============================================================================

/// Validate `config`, load its playbooks and attach the given secret
pub fn build_snapshot(
    config: AgentConfig,
    base_dir: Option<&Path>,
    hmac_key: Vec<u8>,
    generation: u64,
) -> Result<ConfigSnapshot, ConfigError> {
    validate(&config)?;
    if hmac_key.is_empty() {
        return Err(ConfigError::MissingSecret(config.security.hmac_key_env.clone()));
    }
    let playbooks = load_playbooks(&config.playbooks, &config.playbook_sources, base_dir)?;
    let mqtt_password = match &config.outbound.mqtt.password_env {
        Some(var) if config.outbound.mode == OutboundMode::Mqtt => Some(read_secret(var)?),
        _ => None,
    };
    Ok(ConfigSnapshot {
        config,
        playbooks: Arc::new(playbooks),
        hmac_key,
        mqtt_password,
        generation,
    })
}

/// Full load from disk + environment
pub fn load_snapshot(path: &Path, generation: u64) -> Result<ConfigSnapshot, ConfigError> {
    let config = read_config(path)?;
    let key = read_secret(&config.security.hmac_key_env)?;
    build_snapshot(config, path.parent(), key.into_bytes(), generation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CONFIG: &str = r#"
agent: { id: ws-17, name: finance-ws }
detection:
  file_burst_threshold_per_sec: 120
  watch_paths: ["/home/user/Desktop"]
outbound:
  mode: https
  https: { url: "https://collector.local/api/v1/ingest" }
playbooks:
  - name: notify-all
    triggers: { min_severity: warning }
    actions: [{ kind: notify }]
playbook_sources: ["playbooks.d"]
"#;

    fn write_fixture() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("config.yaml"), CONFIG).unwrap();
        std::fs::create_dir(dir.path().join("playbooks.d")).unwrap();
        std::fs::write(
            dir.path().join("playbooks.d/10-contain.yaml"),
            "playbooks:\n  - name: contain\n    triggers: { min_severity: critical }\n    actions: [{ kind: isolate_network }]\n",
        )
        .unwrap();
        dir
    }

    #[test]
    fn test_load_snapshot_resolves_relative_sources() {
        let dir = write_fixture();
        std::env::set_var("RTM_TEST_KEY_LOADER", "s3cret");
        let mut text = std::fs::read_to_string(dir.path().join("config.yaml")).unwrap();
        text.push_str("security: { hmac_key_env: RTM_TEST_KEY_LOADER }\n");
        std::fs::write(dir.path().join("config.yaml"), text).unwrap();

        let snap = load_snapshot(&dir.path().join("config.yaml"), 1).unwrap();
        assert_eq!(snap.config.agent.id, "ws-17");
        assert_eq!(snap.hmac_key, b"s3cret");
        let names: Vec<_> = snap.playbooks.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["notify-all", "contain"]);
    }

    #[test]
    fn test_missing_secret_fails() {
        let dir = write_fixture();
        let mut text = std::fs::read_to_string(dir.path().join("config.yaml")).unwrap();
        text.push_str("security: { hmac_key_env: RTM_TEST_KEY_NEVER_SET }\n");
        std::fs::write(dir.path().join("config.yaml"), text).unwrap();
        assert!(matches!(
            load_snapshot(&dir.path().join("config.yaml"), 1),
            Err(ConfigError::MissingSecret(_))
        ));
    }

    #[test]
    fn test_validation_rules() {
        let path = Path::new("inline.yaml");
        let good = parse_config(path, CONFIG).unwrap();
        assert!(validate(&good).is_ok());

        let mut cfg = good.clone();
        cfg.detection.watch_paths.clear();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = good.clone();
        cfg.detection.file_burst_threshold_per_sec = 0;
        assert!(validate(&cfg).is_err());

        let mut cfg = good.clone();
        cfg.outbound.mode = OutboundMode::Mqtt;
        assert!(validate(&cfg).is_err(), "mqtt mode without host");

        let mut cfg = good;
        cfg.outbound.retry.max_retries = 0;
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn test_unknown_yaml_is_parse_error() {
        assert!(matches!(
            parse_config(Path::new("x.yaml"), "detection: [not, a, map]"),
            Err(ConfigError::Parse { .. })
        ));
    }
}
