//! External adapters: virtual filesystem mounts, kernel module loading
//! and the machine power interface. The core calls these through narrow
//! operations and never depends on how they are implemented.

use crate::error::Result;
use nix::mount::{mount, MsFlags};
use nix::sys::reboot::{reboot, RebootMode};
use std::path::Path;
use std::process::Command;
use tracing::{info, warn};

/// Mount the virtual filesystems a second stage expects. Each mount
/// failure is logged and the rest still mount; a system booted with an
/// initramfs typically has several of these already.
pub fn mount_virtual_filesystems() {
    info!("mounting virtual filesystems");

    mount_one("proc", "/proc", "proc");
    mount_one("sysfs", "/sys", "sysfs");
    mount_one("devtmpfs", "/dev", "devtmpfs");
    mount_one("devpts", "/dev/pts", "devpts");
    mount_one("tmpfs", "/run", "tmpfs");
}

fn mount_one(source: &str, target: &str, fstype: &str) {
    let target_path = Path::new(target);
    if !target_path.exists() {
        if let Err(e) = std::fs::create_dir_all(target_path) {
            warn!(target, error = %e, "cannot create mount point");
            return;
        }
    }

    match mount(
        Some(source),
        target,
        Some(fstype),
        MsFlags::empty(),
        None::<&str>,
    ) {
        Ok(()) => info!(source, target, fstype, "mounted filesystem"),
        Err(e) => warn!(source, target, fstype, error = %e, "mount failed"),
    }
}

/// Load the kernel modules listed for this boot mode.
///
/// The list lives in `etc/modules.load`, with per-mode variants
/// (`modules.load.recovery`, `modules.load.charger`) taking precedence
/// when present. Dependency resolution belongs to modprobe.
pub fn load_kernel_modules(root: &Path, boot_mode: &str) -> usize {
    let list = module_load_list(root, boot_mode);
    let Ok(content) = std::fs::read_to_string(&list) else {
        info!(list = %list.display(), "no module list, skipping module load");
        return 0;
    };

    let mut loaded = 0;
    for line in content.lines() {
        let module = line.trim();
        if module.is_empty() || module.starts_with('#') {
            continue;
        }
        match Command::new("modprobe").arg(module).status() {
            Ok(status) if status.success() => {
                loaded += 1;
            }
            Ok(status) => {
                warn!(module, code = ?status.code(), "modprobe failed");
            }
            Err(e) => {
                warn!(module, error = %e, "cannot run modprobe");
            }
        }
    }

    info!(loaded, list = %list.display(), "kernel modules loaded");
    loaded
}

fn module_load_list(root: &Path, boot_mode: &str) -> std::path::PathBuf {
    let specific = match boot_mode {
        "recovery" => Some(root.join("etc/modules.load.recovery")),
        "charger" => Some(root.join("etc/modules.load.charger")),
        _ => None,
    };
    match specific {
        Some(path) if path.exists() => path,
        _ => root.join("etc/modules.load"),
    }
}

/// Flush filesystem buffers before a power transition.
pub fn sync_disks() {
    unsafe {
        libc::sync();
    }
}

/// Power off the machine.
pub fn power_off() -> Result<()> {
    sync_disks();
    reboot(RebootMode::RB_POWER_OFF)?;
    Ok(())
}

/// Reboot the machine.
pub fn reboot_system() -> Result<()> {
    sync_disks();
    reboot(RebootMode::RB_AUTOBOOT)?;
    Ok(())
}

/// Reboot towards the bootloader target, the critical-service fatal
/// action. The firmware decides what the target means.
pub fn reboot_bootloader() -> Result<()> {
    sync_disks();
    reboot(RebootMode::RB_AUTOBOOT)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn module_list_prefers_mode_specific_file() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("etc")).unwrap();
        std::fs::write(root.path().join("etc/modules.load"), "e1000\n").unwrap();

        assert_eq!(
            module_load_list(root.path(), "normal"),
            root.path().join("etc/modules.load")
        );
        // Variant absent: fall back to the base list.
        assert_eq!(
            module_load_list(root.path(), "recovery"),
            root.path().join("etc/modules.load")
        );

        std::fs::write(root.path().join("etc/modules.load.recovery"), "loop\n").unwrap();
        assert_eq!(
            module_load_list(root.path(), "recovery"),
            root.path().join("etc/modules.load.recovery")
        );
    }

    #[test]
    fn missing_module_list_loads_nothing() {
        let root = TempDir::new().unwrap();
        assert_eq!(load_kernel_modules(root.path(), "normal"), 0);
    }
}
