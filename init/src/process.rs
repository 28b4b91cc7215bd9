//! Process supervision: spawning service children with privilege
//! reduction, stopping them within a bounded interval, and reaping
//! zombies on behalf of PID 1.

use crate::capabilities::{resolve_caps, set_caps_for_exec};
use crate::error::{Error, Result};
use crate::service::{ExitStatus, ServiceDefinition};
use crate::uevent::{resolve_gid, resolve_uid};
use nix::sys::signal::{self, Signal};
use nix::sys::socket::{bind, socket, AddressFamily, SockFlag, SockType, UnixAddr};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{Gid, Pid, Uid};
use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Sanitized PATH handed to every service child.
pub const SANITIZED_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// A child exit together with the service it belonged to, if tracked.
#[derive(Debug, Clone)]
pub struct ReapedChild {
    pub service: Option<String>,
    pub status: ExitStatus,
}

/// Supervisor over every child spawned for a service.
pub struct ProcessSupervisor {
    /// PID to owning service name
    processes: Arc<RwLock<HashMap<u32, String>>>,
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self {
            processes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Fork and exec a service child.
    ///
    /// Identity, groups and capability names are resolved in the parent;
    /// the pre-exec closure only performs syscalls. A failure anywhere in
    /// the child setup or exec surfaces as a spawn error here.
    pub async fn spawn(&self, def: &ServiceDefinition, root: &Path) -> Result<u32> {
        let uid = match &def.user {
            Some(user) => Some(
                resolve_uid(user).ok_or_else(|| Error::UnknownIdentity(user.clone()))?,
            ),
            None => None,
        };
        let gid = match &def.group {
            Some(group) => Some(
                resolve_gid(group).ok_or_else(|| Error::UnknownIdentity(group.clone()))?,
            ),
            None => None,
        };
        let supplementary: Vec<Gid> = def
            .supplementary_groups
            .iter()
            .map(|name| {
                resolve_gid(name)
                    .map(Gid::from_raw)
                    .ok_or_else(|| Error::UnknownIdentity(name.clone()))
            })
            .collect::<Result<_>>()?;
        let caps = match &def.capabilities {
            Some(names) => Some(resolve_caps(names)?),
            None => None,
        };

        let mut cmd = Command::new(&def.exec);
        cmd.args(&def.args);
        cmd.env_clear();
        cmd.env("PATH", SANITIZED_PATH);
        for (key, value) in &def.env {
            cmd.env(key, value);
        }

        // Takes effect in the child, after fork and before exec.
        if let Some(dir) = &def.working_directory {
            cmd.current_dir(dir);
        }

        // Service sockets are created before the fork so the child
        // inherits them; the fd number is published in the environment.
        let mut socket_fds = Vec::new();
        for sock in &def.sockets {
            match create_service_socket(sock, root) {
                Ok(fd) => {
                    cmd.env(
                        format!("SYSBOOT_SOCKET_{}", sock.name),
                        fd.as_raw_fd().to_string(),
                    );
                    socket_fds.push(fd);
                }
                Err(e) => {
                    warn!(service = %def.name, socket = %sock.name, error = %e, "failed to create service socket");
                }
            }
        }

        if def.console {
            cmd.stdin(Stdio::inherit());
            cmd.stdout(Stdio::inherit());
            cmd.stderr(Stdio::inherit());
        } else {
            cmd.stdin(Stdio::null());
            cmd.stdout(Stdio::null());
            cmd.stderr(Stdio::null());
        }

        let priority = def.priority;
        let ioprio = def.ioprio;
        let writepid = def.writepid.clone();

        let child_setup = move || -> io::Result<()> {
            nix::unistd::setsid().map_err(io_err)?;

            if let Some(path) = &writepid {
                let pid = nix::unistd::getpid();
                std::fs::write(path, format!("{}\n", pid))?;
            }

            if !supplementary.is_empty() {
                nix::unistd::setgroups(&supplementary).map_err(io_err)?;
            }
            if let Some(gid) = gid {
                nix::unistd::setgid(Gid::from_raw(gid)).map_err(io_err)?;
            }
            if let Some(uid) = uid {
                nix::unistd::setuid(Uid::from_raw(uid)).map_err(io_err)?;
            }

            if let Some(caps) = &caps {
                set_caps_for_exec(caps)?;
            }

            if let Some(prio) = priority {
                let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, prio) };
                if rc != 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            if let Some((class, level)) = ioprio {
                // IOPRIO_WHO_PROCESS = 1; value = class << 13 | level
                let value = (class.as_raw() << 13) | level as i32;
                let rc = unsafe { libc::syscall(libc::SYS_ioprio_set, 1, 0, value) };
                if rc != 0 {
                    return Err(io::Error::last_os_error());
                }
            }

            Ok(())
        };
        unsafe {
            cmd.pre_exec(child_setup);
        }

        let child = cmd
            .spawn()
            .map_err(|e| Error::ProcessSpawnFailed(format!("{}: {}", def.exec.display(), e)))?;
        drop(socket_fds);

        let pid = child.id();
        info!(service = %def.name, pid, "spawned service process");
        self.processes.write().await.insert(pid, def.name.clone());
        Ok(pid)
    }

    /// Send a signal to a tracked process.
    pub async fn signal(&self, pid: u32, sig: Signal) -> Result<()> {
        if !self.processes.read().await.contains_key(&pid) {
            return Err(Error::ProcessNotFound(pid));
        }
        signal::kill(Pid::from_raw(pid as i32), sig)?;
        debug!(pid, signal = ?sig, "sent signal");
        Ok(())
    }

    /// Stop a process: SIGTERM, wait up to `timeout`, then SIGKILL.
    pub async fn stop(&self, pid: u32, timeout: Duration) -> Result<ExitStatus> {
        self.signal(pid, Signal::SIGTERM).await?;

        let start = std::time::Instant::now();
        loop {
            if let Some(status) = self.try_wait(pid).await? {
                return Ok(status);
            }

            if start.elapsed() > timeout {
                warn!(pid, "process ignored SIGTERM, sending SIGKILL");
                self.signal(pid, Signal::SIGKILL).await?;
                tokio::time::sleep(Duration::from_millis(100)).await;
                if let Some(status) = self.try_wait(pid).await? {
                    return Ok(status);
                }
                return Err(Error::ServiceStopFailed {
                    name: pid.to_string(),
                    reason: "process survived SIGKILL".to_string(),
                });
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Reap a specific child without blocking.
    pub async fn try_wait(&self, pid: u32) -> Result<Option<ExitStatus>> {
        match waitpid(Pid::from_raw(pid as i32), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => {
                self.processes.write().await.remove(&pid);
                Ok(Some(ExitStatus {
                    pid,
                    code: Some(code),
                    signal: None,
                }))
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                self.processes.write().await.remove(&pid);
                Ok(Some(ExitStatus {
                    pid,
                    code: None,
                    signal: Some(sig as i32),
                }))
            }
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(_) => Ok(None),
            Err(nix::Error::ECHILD) => {
                // Already reaped elsewhere or never ours.
                self.processes.write().await.remove(&pid);
                Ok(Some(ExitStatus {
                    pid,
                    code: None,
                    signal: None,
                }))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drain every exited child (PID-1 duty). Returns the exits paired
    /// with the owning service so the manager can react.
    pub async fn reap_zombies(&self) -> Vec<ReapedChild> {
        let mut reaped = Vec::new();

        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    let pid = pid.as_raw() as u32;
                    let service = self.processes.write().await.remove(&pid);
                    debug!(pid, code, service = ?service, "reaped child");
                    reaped.push(ReapedChild {
                        service,
                        status: ExitStatus {
                            pid,
                            code: Some(code),
                            signal: None,
                        },
                    });
                }
                Ok(WaitStatus::Signaled(pid, sig, _)) => {
                    let pid = pid.as_raw() as u32;
                    let service = self.processes.write().await.remove(&pid);
                    debug!(pid, signal = ?sig, service = ?service, "reaped signaled child");
                    reaped.push(ReapedChild {
                        service,
                        status: ExitStatus {
                            pid,
                            code: None,
                            signal: Some(sig as i32),
                        },
                    });
                }
                Ok(WaitStatus::StillAlive) | Err(nix::Error::ECHILD) => break,
                Ok(_) => continue,
                Err(e) => {
                    error!(error = %e, "waitpid failed while reaping");
                    break;
                }
            }
        }

        reaped
    }

    /// The service owning `pid`, when tracked.
    pub async fn service_for_pid(&self, pid: u32) -> Option<String> {
        self.processes.read().await.get(&pid).cloned()
    }

    /// Whether a tracked process is still alive.
    pub async fn is_running(&self, pid: u32) -> bool {
        if !self.processes.read().await.contains_key(&pid) {
            return false;
        }
        match signal::kill(Pid::from_raw(pid as i32), None) {
            Ok(_) => true,
            Err(_) => {
                self.processes.write().await.remove(&pid);
                false
            }
        }
    }
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

fn io_err(e: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

/// Create a service socket under `<root>/dev/socket/<name>` and apply the
/// declared mode and ownership. The fd is left without CLOEXEC so it
/// survives into the child.
fn create_service_socket(
    sock: &crate::service::SocketConfig,
    root: &Path,
) -> Result<OwnedFd> {
    let kind = match sock.kind.as_str() {
        "stream" => SockType::Stream,
        "dgram" => SockType::Datagram,
        "seqpacket" => SockType::SeqPacket,
        other => {
            return Err(Error::ConfigError(format!("unknown socket type: {other}")));
        }
    };

    let dir = root.join("dev/socket");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(&sock.name);
    if path.exists() {
        std::fs::remove_file(&path)?;
    }

    let fd = socket(AddressFamily::Unix, kind, SockFlag::empty(), None)?;
    let addr = UnixAddr::new(&path)?;
    bind(fd.as_raw_fd(), &addr)?;

    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(sock.perm))?;
    let uid = sock.user.as_deref().and_then(resolve_uid).map(Uid::from_raw);
    let gid = sock.group.as_deref().and_then(resolve_gid).map(Gid::from_raw);
    if uid.is_some() || gid.is_some() {
        nix::unistd::chown(&path, uid, gid)?;
    }

    debug!(socket = %path.display(), kind = %sock.kind, "created service socket");
    Ok(fd)
}
