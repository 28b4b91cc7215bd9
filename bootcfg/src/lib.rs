//! Kernel command-line and boot overlay configuration.
//!
//! Collects `key=value` flags from the sources a booting system may carry
//! them in, merged in a fixed order so later sources win:
//!
//! 1. `/proc/cmdline` - kernel arguments
//! 2. `/boot/cmdline.txt` - firmware cmdline overlay
//! 3. `/boot/config.txt` - firmware config overlay (one `key=value` per line)
//! 4. `.cmdline` under the root - local override, merged last
//!
//! A bare `key` token is stored as `key=true`. `#` starts a comment,
//! surrounding whitespace is stripped. The process-wide view is built once
//! and is immutable afterwards; [`BootConfig`] itself is a plain value so
//! tests can construct one from any string.

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use tracing::info;

/// Parsed boot-time flags.
#[derive(Debug, Clone, Default)]
pub struct BootConfig {
    flags: HashMap<String, String>,
}

impl BootConfig {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read every known source under `root`, in override order.
    pub fn from_root(root: &Path) -> Self {
        let mut cfg = Self::new();

        let cmdline = read_and_clean(&root.join("proc/cmdline"));
        if !cmdline.is_empty() {
            info!(source = "proc/cmdline", "merging kernel command line");
            cfg.merge_cmdline(&cmdline);
        }

        let overlay = read_and_clean(&root.join("boot/cmdline.txt"));
        if !overlay.is_empty() {
            info!(source = "boot/cmdline.txt", "merging cmdline overlay");
            cfg.merge_cmdline(&overlay);
        }

        let config_txt = root.join("boot/config.txt");
        if config_txt.exists() {
            info!(source = "boot/config.txt", "merging config overlay");
            cfg.merge_config_txt(&config_txt);
        }

        let local = read_and_clean(&root.join(".cmdline"));
        if !local.is_empty() {
            info!(source = ".cmdline", "merging local overrides");
            cfg.merge_cmdline(&local);
        }

        info!(keys = cfg.flags.len(), "boot configuration initialized");
        cfg
    }

    /// Merge a space-separated cmdline string. `key=value` splits on the
    /// first `=`; a bare `key` becomes `key=true`.
    pub fn merge_cmdline(&mut self, line: &str) {
        for token in line.split_whitespace() {
            match token.split_once('=') {
                Some((key, value)) => {
                    self.flags.insert(key.to_string(), value.to_string());
                }
                None => {
                    self.flags.insert(token.to_string(), "true".to_string());
                }
            }
        }
    }

    /// Merge a `config.txt`-style overlay: one `key=value` per line, so
    /// values may contain spaces. Comments and blank lines are skipped.
    fn merge_config_txt(&mut self, path: &Path) {
        let Ok(content) = std::fs::read_to_string(path) else {
            return;
        };

        for line in content.lines() {
            let line = strip_comment(line).trim();
            if line.is_empty() {
                continue;
            }
            match line.split_once('=') {
                Some((key, value)) => {
                    self.flags
                        .insert(key.trim().to_string(), value.trim().to_string());
                }
                None => {
                    self.flags.insert(line.to_string(), "true".to_string());
                }
            }
        }
    }

    /// Look up a flag, falling back to `default` when absent.
    pub fn get(&self, key: &str, default: &str) -> String {
        self.flags
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    /// Whether a flag is present and not explicitly disabled.
    ///
    /// Recognized false values are `0` and `false`; any other present value
    /// counts as enabled.
    pub fn is_enabled(&self, key: &str) -> bool {
        match self.flags.get(key) {
            Some(value) => value != "0" && value != "false",
            None => false,
        }
    }

    /// Read-only view of every parsed flag.
    pub fn all(&self) -> &HashMap<String, String> {
        &self.flags
    }
}

/// Read a cmdline-style file, dropping comments and flattening the content
/// into a single space-separated line.
fn read_and_clean(path: &Path) -> String {
    let Ok(content) = std::fs::read_to_string(path) else {
        return String::new();
    };

    let mut out = String::new();
    for line in content.lines() {
        let line = strip_comment(line).trim();
        if !line.is_empty() {
            out.push_str(line);
            out.push(' ');
        }
    }
    out
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    }
}

static BOOTCFG: OnceLock<BootConfig> = OnceLock::new();

/// Initialize the process-wide configuration from `root`.
///
/// Safe to call more than once; only the first call reads the sources.
pub fn init_from(root: &Path) -> &'static BootConfig {
    BOOTCFG.get_or_init(|| BootConfig::from_root(root))
}

/// Initialize from the real filesystem root.
pub fn init() -> &'static BootConfig {
    init_from(Path::new("/"))
}

/// Look up a flag in the process-wide configuration.
pub fn get(key: &str, default: &str) -> String {
    init().get(key, default)
}

/// Whether a flag in the process-wide configuration is enabled.
pub fn is_enabled(key: &str) -> bool {
    init().is_enabled(key)
}
