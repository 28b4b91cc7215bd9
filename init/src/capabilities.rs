//! Capability application for service children.
//!
//! A service declaring `capabilities CAP...` gets exactly that set across
//! exec: permitted, inheritable and effective are set to the requested
//! caps, each is raised into the ambient set, and the bounding set is
//! pruned to the same mask. Without the option the child keeps whatever
//! init holds.

use crate::error::{Error, Result};
use capabilities::{Capabilities, Capability, Flag};
use std::io;

/// Resolve a capability by its short name (without the `CAP_` prefix).
pub fn lookup_cap(name: &str) -> Option<Capability> {
    let cap = match name {
        "CHOWN" => Capability::CAP_CHOWN,
        "DAC_OVERRIDE" => Capability::CAP_DAC_OVERRIDE,
        "DAC_READ_SEARCH" => Capability::CAP_DAC_READ_SEARCH,
        "FOWNER" => Capability::CAP_FOWNER,
        "FSETID" => Capability::CAP_FSETID,
        "KILL" => Capability::CAP_KILL,
        "SETGID" => Capability::CAP_SETGID,
        "SETUID" => Capability::CAP_SETUID,
        "SETPCAP" => Capability::CAP_SETPCAP,
        "LINUX_IMMUTABLE" => Capability::CAP_LINUX_IMMUTABLE,
        "NET_BIND_SERVICE" => Capability::CAP_NET_BIND_SERVICE,
        "NET_BROADCAST" => Capability::CAP_NET_BROADCAST,
        "NET_ADMIN" => Capability::CAP_NET_ADMIN,
        "NET_RAW" => Capability::CAP_NET_RAW,
        "IPC_LOCK" => Capability::CAP_IPC_LOCK,
        "IPC_OWNER" => Capability::CAP_IPC_OWNER,
        "SYS_MODULE" => Capability::CAP_SYS_MODULE,
        "SYS_RAWIO" => Capability::CAP_SYS_RAWIO,
        "SYS_CHROOT" => Capability::CAP_SYS_CHROOT,
        "SYS_PTRACE" => Capability::CAP_SYS_PTRACE,
        "SYS_PACCT" => Capability::CAP_SYS_PACCT,
        "SYS_ADMIN" => Capability::CAP_SYS_ADMIN,
        "SYS_BOOT" => Capability::CAP_SYS_BOOT,
        "SYS_NICE" => Capability::CAP_SYS_NICE,
        "SYS_RESOURCE" => Capability::CAP_SYS_RESOURCE,
        "SYS_TIME" => Capability::CAP_SYS_TIME,
        "SYS_TTY_CONFIG" => Capability::CAP_SYS_TTY_CONFIG,
        "MKNOD" => Capability::CAP_MKNOD,
        "LEASE" => Capability::CAP_LEASE,
        "AUDIT_WRITE" => Capability::CAP_AUDIT_WRITE,
        "AUDIT_CONTROL" => Capability::CAP_AUDIT_CONTROL,
        "SETFCAP" => Capability::CAP_SETFCAP,
        "MAC_OVERRIDE" => Capability::CAP_MAC_OVERRIDE,
        "MAC_ADMIN" => Capability::CAP_MAC_ADMIN,
        "SYSLOG" => Capability::CAP_SYSLOG,
        "WAKE_ALARM" => Capability::CAP_WAKE_ALARM,
        "BLOCK_SUSPEND" => Capability::CAP_BLOCK_SUSPEND,
        "AUDIT_READ" => Capability::CAP_AUDIT_READ,
        _ => return None,
    };
    Some(cap)
}

/// Resolve a service's capability name list. Fails on the first unknown
/// name so a typo never silently widens the set.
pub fn resolve_caps(names: &[String]) -> Result<Vec<Capability>> {
    names
        .iter()
        .map(|name| {
            lookup_cap(name).ok_or_else(|| Error::UnknownCapability(name.clone()))
        })
        .collect()
}

/// Highest capability number the running kernel supports.
pub fn last_valid_cap() -> u32 {
    let mut cap: u32 = 0;
    while unsafe { libc::prctl(libc::PR_CAPBSET_READ, cap as libc::c_ulong, 0, 0, 0) } >= 0 {
        cap += 1;
    }
    cap.saturating_sub(1)
}

/// Whether the kernel supports ambient capabilities.
pub fn ambient_supported() -> bool {
    unsafe {
        libc::prctl(
            libc::PR_CAP_AMBIENT,
            libc::PR_CAP_AMBIENT_IS_SET,
            Capability::CAP_CHOWN as libc::c_ulong,
            0,
            0,
        ) >= 0
    }
}

/// Apply the requested capability set in a pre-exec context.
///
/// Sequence follows the three-set model: apply permitted + inheritable +
/// effective with a transient SETPCAP, prune the bounding set, re-apply
/// without SETPCAP, then raise each cap into the ambient set.
pub fn set_caps_for_exec(to_keep: &[Capability]) -> io::Result<()> {
    apply_proc_caps(to_keep, true)?;
    drop_bounding_set(to_keep)?;
    apply_proc_caps(to_keep, false)?;
    raise_ambient(to_keep)
}

fn apply_proc_caps(to_keep: &[Capability], add_setpcap: bool) -> io::Result<()> {
    let mut caps = Capabilities::new()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    caps.reset_all();

    caps.update(to_keep, Flag::Permitted, true);
    caps.update(to_keep, Flag::Inheritable, true);
    caps.update(to_keep, Flag::Effective, true);

    if add_setpcap {
        let setpcap = [Capability::CAP_SETPCAP];
        caps.update(&setpcap, Flag::Permitted, true);
        caps.update(&setpcap, Flag::Effective, true);
    }

    caps.apply()
        .map_err(|e| io::Error::new(io::ErrorKind::PermissionDenied, e.to_string()))
}

fn drop_bounding_set(to_keep: &[Capability]) -> io::Result<()> {
    let keep_mask: u64 = to_keep.iter().fold(0, |mask, cap| mask | 1 << *cap as u8);
    for cap in 0..=last_valid_cap() {
        if keep_mask & (1 << cap) != 0 {
            continue;
        }
        let rc = unsafe { libc::prctl(libc::PR_CAPBSET_DROP, cap as libc::c_ulong, 0, 0, 0) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn raise_ambient(to_raise: &[Capability]) -> io::Result<()> {
    if !ambient_supported() {
        return Ok(());
    }
    for cap in to_raise {
        let rc = unsafe {
            libc::prctl(
                libc::PR_CAP_AMBIENT,
                libc::PR_CAP_AMBIENT_RAISE,
                *cap as libc::c_ulong,
                0,
                0,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_resolves_known_names() {
        assert_eq!(
            lookup_cap("NET_ADMIN").map(|c| c as u8),
            Some(Capability::CAP_NET_ADMIN as u8)
        );
        assert_eq!(
            lookup_cap("CHOWN").map(|c| c as u8),
            Some(Capability::CAP_CHOWN as u8)
        );
        assert!(lookup_cap("NOT_A_CAP").is_none());
        // Names are the short form, not the full constant.
        assert!(lookup_cap("CAP_NET_ADMIN").is_none());
    }

    #[test]
    fn resolve_caps_fails_on_unknown_name() {
        let good = resolve_caps(&["NET_RAW".into(), "KILL".into()]).unwrap();
        let ids: Vec<u8> = good.iter().map(|c| *c as u8).collect();
        assert_eq!(
            ids,
            vec![Capability::CAP_NET_RAW as u8, Capability::CAP_KILL as u8]
        );

        let err = resolve_caps(&["NET_RAW".into(), "TYPO".into()]);
        assert!(matches!(err, Err(Error::UnknownCapability(name)) if name == "TYPO"));
    }

    #[test]
    fn requested_set_is_exactly_what_resolves() {
        // The computed mask carries no surplus bits.
        let caps = resolve_caps(&["SETUID".into(), "SETGID".into()]).unwrap();
        let mask: u64 = caps.iter().fold(0, |m, c| m | 1 << *c as u8);
        let expected =
            1u64 << Capability::CAP_SETUID as u8 | 1u64 << Capability::CAP_SETGID as u8;
        assert_eq!(mask, expected);
    }

    #[test]
    fn last_valid_cap_probe_is_sane() {
        // Every kernel this runs on supports at least the classic 0..=33.
        assert!(last_valid_cap() >= Capability::CAP_AUDIT_READ as u32);
    }
}
