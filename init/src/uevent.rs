//! Device-node permission rules.
//!
//! Two rule vocabularies, both loaded from `ueventd.rc`-style files:
//!
//! ```text
//! /dev/block/sda*       0660  root  disk
//! SUBSYSTEM==input KERNEL==event* 0640 input attr.poll=5000
//! ```
//!
//! Path rules are applied in registration order to a device-node
//! announcement carrying a full path; every matching rule fires, so a
//! later rule overrides an earlier one. Subsystem rules answer lookups by
//! `(subsystem, kernel_name)` when a node is created.
//!
//! Name resolution tries the system databases first and falls back to a
//! fixed table of well-known group names so early boot works before
//! `/etc/group` is available.

use crate::error::{Error, Result};
use crate::rc::tokenize;
use regex::Regex;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::{debug, info, warn};

/// An explicit path rule.
#[derive(Debug)]
pub struct DeviceRule {
    pub pattern: String,
    matcher: Regex,
    pub mode: u32,
    pub user: String,
    pub group: String,
}

/// A subsystem rule for uevent-driven node creation.
#[derive(Debug)]
pub struct SubsystemRule {
    pub subsystem: String,
    pub kernel_pattern: String,
    kernel_matcher: Regex,
    pub mode: u32,
    pub group: Option<String>,
    pub attrs: Vec<(String, String)>,
}

/// Result of a subsystem lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubsystemMatch {
    pub mode: u32,
    pub gid: Option<u32>,
    pub attrs: Vec<(String, String)>,
}

/// Registered device permission rules.
#[derive(Debug, Default)]
pub struct UeventRules {
    pub device_rules: Vec<DeviceRule>,
    pub subsystem_rules: Vec<SubsystemRule>,
}

impl UeventRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load rules from a file. Malformed lines are logged and skipped.
    pub fn load_file(&mut self, path: &Path) -> Result<usize> {
        let content = std::fs::read_to_string(path)?;
        let before = self.device_rules.len() + self.subsystem_rules.len();
        for (idx, line) in content.lines().enumerate() {
            if let Err(e) = self.parse_line(line) {
                warn!(file = %path.display(), line = idx + 1, error = %e, "skipping uevent rule");
            }
        }
        let added = self.device_rules.len() + self.subsystem_rules.len() - before;
        info!(file = %path.display(), rules = added, "loaded uevent rules");
        Ok(added)
    }

    /// Parse one rule line. Blank lines and comments are accepted no-ops.
    pub fn parse_line(&mut self, line: &str) -> Result<()> {
        let tokens = tokenize(line);
        if tokens.is_empty() {
            return Ok(());
        }

        if tokens[0].starts_with("SUBSYSTEM==") {
            return self.parse_subsystem_rule(&tokens);
        }

        if tokens.len() < 4 {
            return Err(Error::ConfigError(format!(
                "path rule needs PATTERN MODE USER GROUP: {line:?}"
            )));
        }

        let mode = u32::from_str_radix(&tokens[1], 8)
            .map_err(|_| Error::ConfigError(format!("invalid mode: {}", tokens[1])))?;

        self.device_rules.push(DeviceRule {
            matcher: glob_to_regex(&tokens[0])?,
            pattern: tokens[0].clone(),
            mode,
            user: tokens[2].clone(),
            group: tokens[3].clone(),
        });
        debug!(pattern = %tokens[0], mode = %format_args!("{mode:o}"), "registered device rule");
        Ok(())
    }

    fn parse_subsystem_rule(&mut self, tokens: &[String]) -> Result<()> {
        let subsystem = tokens[0]
            .strip_prefix("SUBSYSTEM==")
            .unwrap_or_default()
            .to_string();
        if subsystem.is_empty() {
            return Err(Error::ConfigError("empty SUBSYSTEM== match".to_string()));
        }

        let mut kernel_pattern = "*".to_string();
        let mut mode = None;
        let mut group = None;
        let mut attrs = Vec::new();

        for token in &tokens[1..] {
            if let Some(k) = token.strip_prefix("KERNEL==") {
                kernel_pattern = k.to_string();
            } else if let Some(attr) = token.strip_prefix("attr.") {
                match attr.split_once('=') {
                    Some((key, value)) => attrs.push((key.to_string(), value.to_string())),
                    None => {
                        return Err(Error::ConfigError(format!("malformed attr token: {token}")))
                    }
                }
            } else if mode.is_none() {
                mode = Some(u32::from_str_radix(token, 8).map_err(|_| {
                    Error::ConfigError(format!("invalid mode: {token}"))
                })?);
            } else if group.is_none() {
                group = Some(token.clone());
            } else {
                return Err(Error::ConfigError(format!("unexpected token: {token}")));
            }
        }

        let mode =
            mode.ok_or_else(|| Error::ConfigError("subsystem rule without mode".to_string()))?;

        self.subsystem_rules.push(SubsystemRule {
            kernel_matcher: glob_to_regex(&kernel_pattern)?,
            subsystem,
            kernel_pattern,
            mode,
            group,
            attrs,
        });
        Ok(())
    }

    /// Apply every matching path rule to an announced device node, in
    /// registration order (later matches overwrite earlier ones). Returns
    /// the number of rules that matched; syscall failures are logged and
    /// do not stop later rules.
    pub fn apply_to_device(&self, device_path: &str) -> usize {
        self.apply_to_device_at(device_path, Path::new(device_path))
    }

    /// Like [`Self::apply_to_device`], but the announced path and the node
    /// on disk differ; rules match the announcement, syscalls hit the node.
    pub fn apply_to_device_at(&self, announced: &str, node: &Path) -> usize {
        let mut matched = 0;
        for rule in &self.device_rules {
            if !rule.matcher.is_match(announced) {
                continue;
            }
            matched += 1;
            debug!(
                device = announced,
                pattern = %rule.pattern,
                mode = %format_args!("{:o}", rule.mode),
                user = %rule.user,
                group = %rule.group,
                "applying device rule"
            );

            if let Err(e) =
                std::fs::set_permissions(node, std::fs::Permissions::from_mode(rule.mode))
            {
                warn!(device = announced, error = %e, "chmod failed");
            }

            let uid = resolve_uid(&rule.user);
            let gid = resolve_gid(&rule.group);
            if uid.is_none() || gid.is_none() {
                warn!(device = announced, user = %rule.user, group = %rule.group, "cannot resolve rule identity");
                continue;
            }
            if let Err(e) = nix::unistd::chown(
                node,
                uid.map(nix::unistd::Uid::from_raw),
                gid.map(nix::unistd::Gid::from_raw),
            ) {
                warn!(device = announced, error = %e, "chown failed");
            }
        }
        matched
    }

    /// Walk the populated `dev/` tree under `root` and apply the path
    /// rules to every node, announcing each as rules see it (`/dev/...`).
    pub fn apply_all(&self, root: &Path) {
        let mut stack = vec![root.join("dev")];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.filter_map(|e| e.ok()) {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                let announced = match path.strip_prefix(root) {
                    Ok(rel) => format!("/{}", rel.display()),
                    Err(_) => continue,
                };
                self.apply_to_device_at(&announced, &path);
            }
        }
    }

    /// Find the first subsystem rule matching a `(subsystem, kernel)`
    /// announcement.
    pub fn match_subsystem(&self, subsystem: &str, kernel: &str) -> Option<SubsystemMatch> {
        self.subsystem_rules
            .iter()
            .find(|rule| rule.subsystem == subsystem && rule.kernel_matcher.is_match(kernel))
            .map(|rule| SubsystemMatch {
                mode: rule.mode,
                gid: rule.group.as_deref().and_then(resolve_gid),
                attrs: rule.attrs.clone(),
            })
    }
}

/// Translate a `*`/`?` glob into an anchored regex.
pub fn glob_to_regex(glob: &str) -> Result<Regex> {
    let mut pattern = String::with_capacity(glob.len() + 8);
    pattern.push('^');
    for ch in glob.chars() {
        match ch {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            c => pattern.push_str(&regex::escape(&c.to_string())),
        }
    }
    pattern.push('$');
    Regex::new(&pattern)
        .map_err(|e| Error::ConfigError(format!("bad pattern {glob:?}: {e}")))
}

/// Well-known group names with fixed ids, used when the system group
/// database cannot answer. The numbering is part of the device-rule
/// contract and must stay stable.
pub fn well_known_gid(group: &str) -> Option<u32> {
    let gid = match group {
        "root" => 0,
        "tty" => 5,
        "disk" => 6,
        "log" => 1007,
        "dialout" => 20,
        "gpio" => 27,
        "video" => 44,
        "system" => 1000,
        "radio" => 1001,
        "bluetooth" => 1002,
        "graphics" => 1003,
        "input" => 1004,
        "camera" => 1006,
        "compass" => 1008,
        "mount" => 1009,
        "wifi" => 1010,
        "adb" => 1011,
        "install" => 1012,
        "media" => 1013,
        "dhcp" => 1014,
        "sdcard_rw" => 1015,
        "vpn" => 1016,
        "keystore" => 1017,
        "usb" => 1018,
        "i2c" => 1019,
        "media_rw" => 1023,
        "audio" => 1041,
        "shell" => 2000,
        "cache" => 2001,
        "diag" => 2500,
        "net_bt" => 3001,
        "net_bt_admin" => 3002,
        "gps" => 3003,
        "nfc" => 3004,
        "network" => 3005,
        "net" => 3006,
        "net_admin" => 3007,
        "net_raw" => 3008,
        "netlink" => 3009,
        _ => return None,
    };
    Some(gid)
}

/// Resolve a group name: system database, well-known table, then a bare
/// numeric id.
pub fn resolve_gid(name: &str) -> Option<u32> {
    if let Ok(Some(group)) = nix::unistd::Group::from_name(name) {
        return Some(group.gid.as_raw());
    }
    if let Some(gid) = well_known_gid(name) {
        return Some(gid);
    }
    name.parse().ok()
}

/// Resolve a user name via the system database, falling back to a bare
/// numeric id.
pub fn resolve_uid(name: &str) -> Option<u32> {
    if let Ok(Some(user)) = nix::unistd::User::from_name(name) {
        return Some(user.uid.as_raw());
    }
    name.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn glob_translation_matches_like_a_glob() {
        let re = glob_to_regex("/dev/block/sda*").unwrap();
        assert!(re.is_match("/dev/block/sda"));
        assert!(re.is_match("/dev/block/sda1"));
        assert!(!re.is_match("/dev/block/sdb1"));
        assert!(!re.is_match("prefix/dev/block/sda1"));

        let re = glob_to_regex("/dev/tty?").unwrap();
        assert!(re.is_match("/dev/tty0"));
        assert!(!re.is_match("/dev/tty"));
        assert!(!re.is_match("/dev/tty10"));
    }

    #[test]
    fn glob_translation_escapes_regex_metacharacters() {
        let re = glob_to_regex("/dev/v4l.0+x").unwrap();
        assert!(re.is_match("/dev/v4l.0+x"));
        // "." and "+" are literals, not regex operators.
        assert!(!re.is_match("/dev/v4lA0+x"));
        assert!(!re.is_match("/dev/v4l.0xx"));
    }

    #[test]
    fn path_rules_apply_in_order() {
        let mut rules = UeventRules::new();
        rules.parse_line("/dev/block/sda* 0660 root disk").unwrap();
        rules.parse_line("# comment line").unwrap();
        rules.parse_line("").unwrap();
        assert_eq!(rules.device_rules.len(), 1);

        let dir = TempDir::new().unwrap();
        let block = dir.path().join("dev/block");
        std::fs::create_dir_all(&block).unwrap();
        let node = block.join("sda1");
        std::fs::write(&node, b"").unwrap();

        let applied = rules.apply_to_device_at("/dev/block/sda1", &node);
        assert_eq!(applied, 1);
        let mode = std::fs::metadata(&node).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o660);

        // A non-matching announcement fires nothing.
        assert_eq!(rules.apply_to_device("/dev/null"), 0);
    }

    #[test]
    fn malformed_rules_are_rejected() {
        let mut rules = UeventRules::new();
        assert!(rules.parse_line("/dev/foo 0660 root").is_err());
        assert!(rules.parse_line("/dev/foo 99x root disk").is_err());
        assert!(rules.parse_line("SUBSYSTEM== 0660 disk").is_err());
        assert!(rules.device_rules.is_empty());
    }

    #[test]
    fn subsystem_rules_match_kernel_names() {
        let mut rules = UeventRules::new();
        rules
            .parse_line("SUBSYSTEM==input KERNEL==event* 0640 input attr.poll=5000")
            .unwrap();

        let m = rules.match_subsystem("input", "event3").unwrap();
        assert_eq!(m.mode, 0o640);
        assert_eq!(m.attrs, vec![("poll".to_string(), "5000".to_string())]);

        assert!(rules.match_subsystem("input", "mouse0").is_none());
        assert!(rules.match_subsystem("block", "event3").is_none());
    }

    #[test]
    fn well_known_table_covers_the_required_minimum() {
        let required = [
            ("root", 0),
            ("system", 1000),
            ("shell", 2000),
            ("cache", 2001),
            ("net_raw", 3008),
            ("net_admin", 3007),
            ("sdcard_rw", 1015),
            ("media", 1013),
            ("audio", 1041),
            ("graphics", 1003),
            ("input", 1004),
            ("log", 1007),
        ];
        for (name, gid) in required {
            assert_eq!(well_known_gid(name), Some(gid), "group {name}");
        }
        assert_eq!(well_known_gid("made_up"), None);
    }

    #[test]
    fn resolve_gid_falls_back_to_table_and_numerics() {
        // "sdcard_rw" exists in no standard /etc/group; the table answers.
        assert_eq!(resolve_gid("sdcard_rw"), Some(1015));
        assert_eq!(resolve_gid("12345"), Some(12345));
        assert_eq!(resolve_gid("no_such_group_xyz"), None);
    }

    #[test]
    fn resolve_uid_accepts_numeric_ids() {
        assert_eq!(resolve_uid("0"), Some(0));
        assert_eq!(resolve_uid("54321"), Some(54321));
        assert_eq!(resolve_uid("no_such_user_xyz"), None);
    }
}
