//! Playbook Loader
//!
//! Builds the ordered playbook set: inline playbooks first, then each
//! source in declared order. A directory source contributes its
//! `*.yaml` / `*.yml` files sorted by name. Load order is evaluation order.
//!
//! Any unreadable, unparsable or invalid playbook fails the whole load.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use super::types::{Playbook, PlaybookError, PlaybookFile};

fn is_yaml(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"))
        .unwrap_or(false)
}

/// Expand one source into its files, in evaluation order
fn expand_source(source: &Path) -> Result<Vec<PathBuf>, PlaybookError> {
    let io_err = |e| PlaybookError::Io {
        path: source.to_path_buf(),
        source: e,
    };
    let meta = fs::metadata(source).map_err(io_err)?;
    if !meta.is_dir() {
        return Ok(vec![source.to_path_buf()]);
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(source).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if path.is_file() && is_yaml(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Parse one file: `playbooks: [...]`, a bare list, or a single playbook
pub fn parse_playbooks(path: &Path, text: &str) -> Result<Vec<Playbook>, PlaybookError> {
    let parse_err = |e: serde_yaml::Error| PlaybookError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    };

    let value: serde_yaml::Value = serde_yaml::from_str(text).map_err(parse_err)?;
    match &value {
        serde_yaml::Value::Null => Ok(Vec::new()),
        serde_yaml::Value::Sequence(_) => serde_yaml::from_value(value).map_err(parse_err),
        serde_yaml::Value::Mapping(map) if map.contains_key("playbooks") => {
            let file: PlaybookFile = serde_yaml::from_value(value).map_err(parse_err)?;
            Ok(file.playbooks)
        }
        _ => {
            let single: Playbook = serde_yaml::from_value(value).map_err(parse_err)?;
            Ok(vec![single])
        }
    }
}

/// Resolve `source` against the config file's directory when relative
fn resolve(source: &Path, base_dir: Option<&Path>) -> PathBuf {
    match base_dir {
        Some(base) if source.is_relative() => base.join(source),
        _ => source.to_path_buf(),
    }
}

pub fn load_playbooks(
    inline: &[Playbook],
    sources: &[PathBuf],
    base_dir: Option<&Path>,
) -> Result<Vec<Playbook>, PlaybookError> {
    let mut ordered: Vec<Playbook> = inline.to_vec();

    for source in sources {
        let source = resolve(source, base_dir);
        for file in expand_source(&source)? {
            let text = fs::read_to_string(&file).map_err(|e| PlaybookError::Io {
                path: file.clone(),
                source: e,
            })?;
            let parsed = parse_playbooks(&file, &text)?;
            log::debug!("[SOAR] {} playbook(s) from {:?}", parsed.len(), file);
            ordered.extend(parsed);
        }
    }

    let mut seen = HashSet::new();
    for playbook in &ordered {
        playbook.validate()?;
        if !seen.insert(playbook.name.clone()) {
            return Err(PlaybookError::Duplicate(playbook.name.clone()));
        }
    }

    log::info!(
        "[SOAR] Loaded {} playbook(s): {}",
        ordered.len(),
        ordered.iter().map(|p| p.name.as_str()).collect::<Vec<_>>().join(", ")
    );
    Ok(ordered)
}
