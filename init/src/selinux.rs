//! Security policy bootstrap.
//!
//! Reads the `/etc/selinux/config`-style descriptor, normalizes the
//! requested mode into properties, and scans the policy whitelist
//! directories. A system with no loadable policy anywhere is pinned to
//! permissive for the life of the process.

use crate::properties::PropertyStore;
use bootcfg::BootConfig;
use std::path::Path;
use tracing::{info, warn};

/// Policy directories scanned during bootstrap, relative to the root.
pub const POLICY_WHITELIST: &[&str] = &["etc/selinux", "oem/etc/selinux", "usr/share/etc/selinux"];

/// Diagnostic property set when no valid policy is found.
pub const POLICY_FAULT_PROP: &str = "init.err.selinux";

/// Effective enforcement mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnforcingMode {
    Enforcing,
    Permissive,
}

impl EnforcingMode {
    fn as_str(self) -> &'static str {
        match self {
            EnforcingMode::Enforcing => "enforcing",
            EnforcingMode::Permissive => "permissive",
        }
    }
}

/// Loaded security state. Immutable after bootstrap.
#[derive(Debug)]
pub struct SecurityState {
    mode: EnforcingMode,
    policy_type: Option<String>,
    policy_entries: usize,
}

impl SecurityState {
    pub fn is_enforcing(&self) -> bool {
        self.mode == EnforcingMode::Enforcing
    }

    pub fn policy_type(&self) -> Option<&str> {
        self.policy_type.as_deref()
    }

    pub fn policy_entries(&self) -> usize {
        self.policy_entries
    }
}

/// Load the security configuration and publish the `ro.boot.selinux*`
/// properties. Never fails: every problem degrades to permissive.
pub fn setup(root: &Path, props: &PropertyStore, bootcfg: &BootConfig) -> SecurityState {
    let (mut mode, policy_type) = parse_config(&root.join("etc/selinux/config"));

    // Kernel cmdline override wins over the config file.
    if bootcfg.get("sysboot.selinux", "") == "permissive" {
        info!("permissive mode requested on the kernel command line");
        mode = EnforcingMode::Permissive;
    }

    let policy_entries: usize = POLICY_WHITELIST
        .iter()
        .map(|dir| scan_policy_dir(&root.join(dir)))
        .sum();

    if policy_entries == 0 {
        warn!("no valid policy in any whitelisted directory, pinning permissive");
        mode = EnforcingMode::Permissive;
        props.override_set(POLICY_FAULT_PROP, "no_policy");
    }

    props.override_set("ro.boot.selinux", mode.as_str());
    if let Some(policy_type) = &policy_type {
        props.override_set("ro.boot.selinux_type", policy_type);
    }

    info!(
        mode = mode.as_str(),
        policy_type = policy_type.as_deref().unwrap_or("unknown"),
        entries = policy_entries,
        "security bootstrap complete"
    );

    SecurityState {
        mode,
        policy_type,
        policy_entries,
    }
}

/// Parse `SELINUX=` and `SELINUXTYPE=` out of the config file. A missing
/// or unreadable file, and the `disabled` state, normalize to permissive.
fn parse_config(path: &Path) -> (EnforcingMode, Option<String>) {
    let Ok(content) = std::fs::read_to_string(path) else {
        warn!(path = %path.display(), "security config missing, defaulting to permissive");
        return (EnforcingMode::Permissive, None);
    };

    let mut state = None;
    let mut policy_type = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(value) = line.strip_prefix("SELINUX=") {
            state = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("SELINUXTYPE=") {
            policy_type = Some(value.trim().to_string());
        }
    }

    let mode = match state.as_deref() {
        Some("enforcing") => EnforcingMode::Enforcing,
        Some("permissive") => EnforcingMode::Permissive,
        Some("disabled") => {
            warn!("policy disabled in configuration, treating as permissive");
            EnforcingMode::Permissive
        }
        Some(other) => {
            warn!(state = other, "unknown enforcement state, treating as permissive");
            EnforcingMode::Permissive
        }
        None => EnforcingMode::Permissive,
    };

    (mode, policy_type)
}

/// Count policy entries in a directory tree. A policy line is one that
/// carries a security context label.
fn scan_policy_dir(dir: &Path) -> usize {
    let mut entries = 0;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(dir_entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in dir_entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                entries += count_policy_lines(&path);
            }
        }
    }
    entries
}

fn count_policy_lines(path: &Path) -> usize {
    let Ok(content) = std::fs::read_to_string(path) else {
        return 0;
    };
    content
        .lines()
        .map(str::trim)
        .filter(|line| {
            !line.is_empty() && !line.starts_with('#') && line.contains("system_u:object_")
        })
        .count()
}
