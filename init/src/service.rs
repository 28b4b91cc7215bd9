//! Service definition and runtime state types.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::path::PathBuf;

/// Current state of a supervised service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Not running
    Stopped,
    /// Start sequence in progress
    Starting,
    /// Child process is alive
    Running,
    /// Exited, waiting out the restart backoff
    Restarting,
    /// Declared `disabled`; excluded from class starts
    Disabled,
    /// Critical service gave up after a restart storm
    Fatal,
}

impl ServiceState {
    /// The value mirrored into `init.svc.<name>`. The mirror vocabulary is
    /// narrower than the internal state set.
    pub fn mirror_value(self) -> &'static str {
        match self {
            ServiceState::Stopped | ServiceState::Fatal => "stopped",
            ServiceState::Starting | ServiceState::Running => "running",
            ServiceState::Restarting => "restarting",
            ServiceState::Disabled => "disabled",
        }
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceState::Stopped => "stopped",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Restarting => "restarting",
            ServiceState::Disabled => "disabled",
            ServiceState::Fatal => "fatal",
        };
        write!(f, "{}", s)
    }
}

/// IO scheduling class for the `ioprio` service option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoClass {
    Rt,
    Be,
    Idle,
}

impl IoClass {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "rt" => Some(IoClass::Rt),
            "be" => Some(IoClass::Be),
            "idle" => Some(IoClass::Idle),
            _ => None,
        }
    }

    /// Kernel class number for `ioprio_set(2)`.
    pub fn as_raw(self) -> i32 {
        match self {
            IoClass::Rt => 1,
            IoClass::Be => 2,
            IoClass::Idle => 3,
        }
    }
}

/// Socket created for a service before it is spawned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketConfig {
    pub name: String,
    /// `stream`, `dgram` or `seqpacket`
    pub kind: String,
    pub perm: u32,
    pub user: Option<String>,
    pub group: Option<String>,
}

/// A parsed `service` block. Immutable after parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDefinition {
    pub name: String,
    pub exec: PathBuf,
    pub args: Vec<String>,
    pub user: Option<String>,
    pub group: Option<String>,
    pub supplementary_groups: Vec<String>,
    pub class: String,
    pub oneshot: bool,
    pub disabled: bool,
    pub critical: bool,
    /// Capability names to retain; `Some(vec![])` drops everything,
    /// `None` keeps the inherited sets.
    pub capabilities: Option<Vec<String>>,
    /// Nice value applied in the child
    pub priority: Option<i32>,
    pub ioprio: Option<(IoClass, u8)>,
    /// Keep the console instead of redirecting stdio to /dev/null
    pub console: bool,
    pub seclabel: Option<String>,
    pub env: Vec<(String, String)>,
    /// Directory the child chdirs to before exec
    pub working_directory: Option<PathBuf>,
    pub sockets: Vec<SocketConfig>,
    /// Write the child pid to this path after fork
    pub writepid: Option<PathBuf>,
}

impl ServiceDefinition {
    /// Create a definition with defaults for every option.
    pub fn new(name: impl Into<String>, exec: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            exec: exec.into(),
            args: Vec::new(),
            user: None,
            group: None,
            supplementary_groups: Vec::new(),
            class: "default".to_string(),
            oneshot: false,
            disabled: false,
            critical: false,
            capabilities: None,
            priority: None,
            ioprio: None,
            console: false,
            seclabel: None,
            env: Vec::new(),
            working_directory: None,
            sockets: Vec::new(),
            writepid: None,
        }
    }
}

/// How a reaped child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub pid: u32,
    /// Exit code when the child exited normally
    pub code: Option<i32>,
    /// Signal number when the child was killed
    pub signal: Option<i32>,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runtime record for a registered service. Mutated only by the
/// supervisor.
#[derive(Debug, Clone)]
pub struct ServiceInstance {
    pub name: String,
    pub state: ServiceState,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub exit_status: Option<ExitStatus>,
    /// Recent crash timestamps, for the critical-service storm window
    pub crashes: VecDeque<DateTime<Utc>>,
}

impl ServiceInstance {
    pub fn new(name: impl Into<String>, disabled: bool) -> Self {
        Self {
            name: name.into(),
            state: if disabled {
                ServiceState::Disabled
            } else {
                ServiceState::Stopped
            },
            pid: None,
            started_at: None,
            stopped_at: None,
            restart_count: 0,
            exit_status: None,
            crashes: VecDeque::new(),
        }
    }

    /// Whether the service currently holds a live child.
    pub fn is_active(&self) -> bool {
        matches!(self.state, ServiceState::Starting | ServiceState::Running)
    }

    pub fn uptime_secs(&self) -> Option<u64> {
        if !self.is_active() {
            return None;
        }
        self.started_at.map(|start| {
            let secs = Utc::now().signed_duration_since(start).num_seconds();
            secs.max(0) as u64
        })
    }
}

/// Point-in-time status snapshot for `list()` and diagnostics.
#[derive(Debug, Clone)]
pub struct ServiceStatus {
    pub name: String,
    pub state: ServiceState,
    pub class: String,
    pub pid: Option<u32>,
    pub oneshot: bool,
    pub restart_count: u32,
    pub uptime_secs: Option<u64>,
}

impl ServiceStatus {
    pub fn from_service(def: &ServiceDefinition, instance: &ServiceInstance) -> Self {
        Self {
            name: def.name.clone(),
            state: instance.state,
            class: def.class.clone(),
            pid: instance.pid,
            oneshot: def.oneshot,
            restart_count: instance.restart_count,
            uptime_secs: instance.uptime_secs(),
        }
    }
}
