//! Network Isolation
//!
//! Disables every non-loopback interface. Re-enabling is left to an
//! operator (`rtm-agent restore-network`), never done automatically.
//!
//! Windows: `netsh interface set interface <name> admin=disabled`
//! Linux:   `ip link set dev <name> down`
//! Others:  `Unsupported`

use std::process::Command;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use super::types::ActionError;

// ============================================================================
// STATE
// ============================================================================

/// Interfaces this process disabled
static ISOLATED_INTERFACES: Lazy<RwLock<Vec<String>>> = Lazy::new(|| RwLock::new(Vec::new()));

pub fn isolated_interfaces() -> Vec<String> {
    ISOLATED_INTERFACES.read().clone()
}

pub fn is_loopback(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower == "lo" || lower == "lo0" || lower.starts_with("loopback")
}

// ============================================================================
// INTERFACE DISCOVERY
// ============================================================================

/// Parse `netsh interface show interface` output into interface names
pub fn parse_netsh_interfaces(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('-') && !l.starts_with("Admin State"))
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            // Admin State | State | Type | Interface Name (may contain spaces)
            if cols.len() < 4 {
                return None;
            }
            Some(cols[3..].join(" "))
        })
        .collect()
}

#[cfg(windows)]
fn list_interfaces() -> Result<Vec<String>, ActionError> {
    let output = Command::new("netsh")
        .args(["interface", "show", "interface"])
        .output()
        .map_err(|e| ActionError::CommandFailed(format!("netsh: {}", e)))?;
    if !output.status.success() {
        return Err(ActionError::CommandFailed(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    Ok(parse_netsh_interfaces(&String::from_utf8_lossy(&output.stdout)))
}

#[cfg(target_os = "linux")]
fn list_interfaces() -> Result<Vec<String>, ActionError> {
    let entries = std::fs::read_dir("/sys/class/net")
        .map_err(|e| ActionError::CommandFailed(format!("/sys/class/net: {}", e)))?;
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    Ok(names)
}

#[cfg(windows)]
fn set_interface(name: &str, up: bool) -> Result<(), ActionError> {
    let state = if up { "admin=enabled" } else { "admin=disabled" };
    run(Command::new("netsh").args(["interface", "set", "interface", name, state]))
}

#[cfg(target_os = "linux")]
fn set_interface(name: &str, up: bool) -> Result<(), ActionError> {
    let state = if up { "up" } else { "down" };
    run(Command::new("ip").args(["link", "set", "dev", name, state]))
}

#[cfg(any(windows, target_os = "linux"))]
fn run(cmd: &mut Command) -> Result<(), ActionError> {
    let output = cmd
        .output()
        .map_err(|e| ActionError::CommandFailed(e.to_string()))?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let text = format!("{} {}", stderr.trim(), stdout.trim()).to_lowercase();
    if text.contains("access is denied")
        || text.contains("operation not permitted")
        || text.contains("elevation")
        || text.contains("administrator")
    {
        Err(ActionError::PermissionDenied(text.trim().to_string()))
    } else {
        Err(ActionError::CommandFailed(text.trim().to_string()))
    }
}

// ============================================================================
// ACTIONS
// ============================================================================

/// Disable all non-loopback interfaces
#[cfg(any(windows, target_os = "linux"))]
pub fn isolate_network() -> Result<String, ActionError> {
    let targets: Vec<String> = list_interfaces()?
        .into_iter()
        .filter(|n| !is_loopback(n))
        .collect();
    if targets.is_empty() {
        return Err(ActionError::NotFound("no non-loopback interfaces".to_string()));
    }

    let mut disabled = Vec::new();
    let mut last_error = None;
    for nic in &targets {
        match set_interface(nic, false) {
            Ok(()) => {
                log::warn!("[SOAR] Interface disabled: {}", nic);
                disabled.push(nic.clone());
            }
            Err(e) => {
                log::error!("[SOAR] Failed to disable {}: {}", nic, e);
                last_error = Some(e);
            }
        }
    }

    if disabled.is_empty() {
        return Err(last_error.unwrap_or_else(|| ActionError::CommandFailed("no interface disabled".into())));
    }

    let mut isolated = ISOLATED_INTERFACES.write();
    for nic in &disabled {
        if !isolated.contains(nic) {
            isolated.push(nic.clone());
        }
    }
    Ok(format!(
        "disabled {} of {} interfaces: {}",
        disabled.len(),
        targets.len(),
        disabled.join(", ")
    ))
}

#[cfg(not(any(windows, target_os = "linux")))]
pub fn isolate_network() -> Result<String, ActionError> {
    Err(ActionError::Unsupported(format!(
        "interface disable not implemented on {}",
        std::env::consts::OS
    )))
}

/// Operator-initiated re-enable of the named interfaces (or every non-loopback one)
#[cfg(any(windows, target_os = "linux"))]
pub fn restore_network(names: &[String]) -> Result<Vec<String>, ActionError> {
    let targets: Vec<String> = if names.is_empty() {
        list_interfaces()?
            .into_iter()
            .filter(|n| !is_loopback(n))
            .collect()
    } else {
        names.to_vec()
    };

    let mut restored = Vec::new();
    for nic in &targets {
        set_interface(nic, true)?;
        log::info!("[SOAR] Interface re-enabled: {}", nic);
        restored.push(nic.clone());
    }
    ISOLATED_INTERFACES.write().retain(|n| !restored.contains(n));
    Ok(restored)
}

#[cfg(not(any(windows, target_os = "linux")))]
pub fn restore_network(_names: &[String]) -> Result<Vec<String>, ActionError> {
    Err(ActionError::Unsupported(std::env::consts::OS.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_detection() {
        assert!(is_loopback("lo"));
        assert!(is_loopback("Loopback Pseudo-Interface 1"));
        assert!(!is_loopback("eth0"));
        assert!(!is_loopback("Wi-Fi"));
    }

    #[test]
    fn test_parse_netsh_output() {
        let out = "\r\nAdmin State    State          Type             Interface Name\r\n\
-------------------------------------------------------------------------\r\n\
Enabled        Connected      Dedicated        Ethernet 2\r\n\
Enabled        Disconnected   Dedicated        Wi-Fi\r\n";
        assert_eq!(parse_netsh_interfaces(out), vec!["Ethernet 2", "Wi-Fi"]);
    }
}
