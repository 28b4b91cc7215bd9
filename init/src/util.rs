//! Small helpers shared across the init engine.

use std::io::Write;
use std::path::Path;

/// Overwrite a file atomically: write a sibling temp file, fsync, rename.
pub fn write_file_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}

/// The default interactive user: the sole sub-directory under `/home`,
/// when exactly one exists.
pub fn sole_home_user(root: &Path) -> Option<String> {
    let entries = std::fs::read_dir(root.join("home")).ok()?;
    let mut dirs = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().into_string().ok());

    let first = dirs.next()?;
    match dirs.next() {
        None => Some(first),
        Some(_) => None,
    }
}

/// Probe the graphics stack. Scans the DRM class for a known PCI vendor,
/// falling back to the Mali device node old kernels expose.
pub fn detect_gpu(root: &Path) -> &'static str {
    let drm = root.join("sys/class/drm");
    let mut saw_card = false;

    if let Ok(entries) = std::fs::read_dir(&drm) {
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with("card") || name.contains('-') {
                continue;
            }
            saw_card = true;
            let vendor_path = entry.path().join("device/vendor");
            let Ok(vendor) = std::fs::read_to_string(&vendor_path) else {
                continue;
            };
            match vendor.trim() {
                "0x10de" => return "nvidia",
                "0x1002" => return "amd",
                "0x8086" => return "intel",
                "0x13b5" => return "arm",
                "0x1010" => return "powervr",
                _ => {}
            }
        }
    }

    if root.join("sys/class/misc/mali0").exists() {
        return "mali";
    }

    if saw_card {
        "unknown"
    } else {
        "none"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn atomic_write_replaces_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub/file.txt");

        write_file_atomic(&path, b"first").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first");

        write_file_atomic(&path, b"second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
    }

    #[test]
    fn sole_home_user_requires_exactly_one_directory() {
        let root = TempDir::new().unwrap();
        assert_eq!(sole_home_user(root.path()), None);

        std::fs::create_dir_all(root.path().join("home/alice")).unwrap();
        assert_eq!(sole_home_user(root.path()), Some("alice".to_string()));

        // A stray file does not count.
        std::fs::write(root.path().join("home/README"), b"").unwrap();
        assert_eq!(sole_home_user(root.path()), Some("alice".to_string()));

        std::fs::create_dir_all(root.path().join("home/bob")).unwrap();
        assert_eq!(sole_home_user(root.path()), None);
    }

    #[test]
    fn gpu_probe_reads_drm_vendor() {
        let root = TempDir::new().unwrap();
        assert_eq!(detect_gpu(root.path()), "none");

        let device = root.path().join("sys/class/drm/card0/device");
        std::fs::create_dir_all(&device).unwrap();
        std::fs::write(device.join("vendor"), "0x10de\n").unwrap();
        assert_eq!(detect_gpu(root.path()), "nvidia");

        std::fs::write(device.join("vendor"), "0xdead\n").unwrap();
        assert_eq!(detect_gpu(root.path()), "unknown");
    }

    #[test]
    fn gpu_probe_falls_back_to_mali_node() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("sys/class/misc/mali0")).unwrap();
        assert_eq!(detect_gpu(root.path()), "mali");
    }
}
