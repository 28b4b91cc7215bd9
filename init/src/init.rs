//! Second-stage orchestration: bootstrap sequence, event channel and the
//! cooperative main loop.
//!
//! The loop owns the trigger registry and the action queue outright.
//! Everything asynchronous funnels into it through two channels: property
//! change notifications from the store, and [`InitEvent`]s raised by
//! commands or the supervisor. Signals arrive through the runtime's
//! signal driver and are handled between actions, never during one.

use crate::actions::{ActionManager, Dispatch};
use crate::error::{Error, Result};
use crate::manager::ServiceManager;
use crate::properties::{PropertyChange, PropertyStore};
use crate::rc::Parser;
use crate::selinux::{self, SecurityState};
use crate::sys;
use crate::uevent::UeventRules;
use crate::util::{detect_gpu, sole_home_user};
use bootcfg::BootConfig;
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

/// The synthetic boot events, queued in this order.
pub const BOOT_EVENTS: [&str; 4] = ["early-init", "init", "late-init", "boot"];

/// Directories scanned for `*.rc` files, relative to the root.
pub const INIT_DIRS: [&str; 3] = ["etc/init", "usr/share/etc/init", "oem/etc/init"];

/// Property default files loaded before anything else, relative to the root.
pub const PROP_DEFAULT_FILES: [&str; 2] = ["etc/prop.default", "usr/share/etc/prop.default"];

/// How the process should leave the main loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownType {
    PowerOff,
    Reboot,
    /// The critical-service fatal action
    RebootBootloader,
}

/// Work raised towards the main loop from commands and the supervisor.
#[derive(Debug)]
pub enum InitEvent {
    /// `trigger NAME` from a command block
    Trigger(String),
    /// A shutdown request
    Shutdown(ShutdownType),
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct InitConfig {
    /// Filesystem root every path resolves against
    pub root: PathBuf,
    /// Whether to enforce the PID 1 requirement
    pub require_pid1: bool,
    /// Whether the first stage mounts virtual filesystems
    pub mount_filesystems: bool,
    /// Persistent property backing file; defaults to
    /// `var/lib/sysboot/persist.prop` under the root
    pub persist_file: Option<PathBuf>,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/"),
            require_pid1: true,
            mount_filesystems: true,
            persist_file: None,
        }
    }
}

/// Shared handles every command executor receives.
pub struct InitContext {
    pub props: PropertyStore,
    pub services: ServiceManager,
    pub root: PathBuf,
    pub events: UnboundedSender<InitEvent>,
}

impl InitContext {
    /// Resolve a configuration path against the configured root, so a
    /// non-PID-1 instance stays confined to its own tree.
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let rel = path.strip_prefix('/').unwrap_or(path);
        self.root.join(rel)
    }
}

enum Wake {
    Child,
    Terminate,
    Hangup,
    Event(InitEvent),
    Change(PropertyChange),
    Closed,
}

/// The second-stage runtime.
pub struct Init {
    config: InitConfig,
    ctx: InitContext,
    actions: ActionManager,
    uevent_rules: UeventRules,
    security: Option<SecurityState>,
    events_rx: UnboundedReceiver<InitEvent>,
    changes_rx: UnboundedReceiver<PropertyChange>,
    pending_shutdown: Option<ShutdownType>,
}

impl Init {
    /// Create the runtime. Fails when PID 1 is required but this process
    /// is not it.
    pub fn new(config: InitConfig) -> Result<Self> {
        let pid = std::process::id();
        if config.require_pid1 && pid != 1 {
            return Err(Error::NotPid1(pid));
        }

        let persist = config
            .persist_file
            .clone()
            .unwrap_or_else(|| config.root.join("var/lib/sysboot/persist.prop"));
        let props = PropertyStore::with_persist(persist);
        let changes_rx = props.subscribe(|_| true);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let services = ServiceManager::new(props.clone(), config.root.clone(), events_tx.clone());

        let ctx = InitContext {
            props,
            services,
            root: config.root.clone(),
            events: events_tx,
        };

        Ok(Self {
            config,
            ctx,
            actions: ActionManager::new(),
            uevent_rules: UeventRules::new(),
            security: None,
            events_rx,
            changes_rx,
            pending_shutdown: None,
        })
    }

    /// Run the documented second-stage sequence up to the point where the
    /// main loop takes over.
    pub async fn bootstrap(&mut self) -> Result<()> {
        let root = self.config.root.clone();
        info!(root = %root.display(), "second stage starting");

        // Property defaults first; everything after may condition on them.
        for file in PROP_DEFAULT_FILES {
            let path = root.join(file);
            if path.exists() {
                match self.ctx.props.load_file(&path) {
                    Ok(count) => info!(file, count, "loaded property defaults"),
                    Err(e) => warn!(file, error = %e, "failed to load property defaults"),
                }
            }
        }
        self.ctx.props.override_set("init.completed", "false");

        // Kernel cmdline ingest seeds the ro.boot namespace.
        let bootcfg = BootConfig::from_root(&root);
        self.seed_boot_properties(&bootcfg);

        // Security policy, then the environment probes.
        self.security = Some(selinux::setup(&root, &self.ctx.props, &bootcfg));

        if let Some(user) = sole_home_user(&root) {
            self.ctx.props.override_set("ro.boot.user", &user);
        }

        // Walk the init directories; imports recurse from here.
        let props = self.ctx.props.clone();
        let mut parser = Parser::new(&props);
        for dir in INIT_DIRS {
            parser.parse_dir(&root.join(dir));
        }
        info!(
            triggers = parser.triggers.len(),
            services = parser.services.len(),
            "configuration parsed"
        );
        self.actions.register_all(parser.triggers);
        self.ctx.services.register_all(parser.services).await;

        // Device permission rules for nodes the first stage populated.
        let ueventd_rc = root.join("etc/ueventd.rc");
        if ueventd_rc.exists() {
            if let Err(e) = self.uevent_rules.load_file(&ueventd_rc) {
                warn!(error = %e, "failed to load uevent rules");
            }
            self.uevent_rules.apply_all(&root);
        }

        for event in BOOT_EVENTS {
            self.actions.queue_event(event, &self.ctx.props);
        }
        self.actions.queue_builtin("finish-boot", |ctx| {
            ctx.props.override_set("init.completed", "true");
        });

        Ok(())
    }

    fn seed_boot_properties(&self, bootcfg: &BootConfig) {
        for (key, value) in bootcfg.all() {
            if let Some(rest) = key.strip_prefix("sysboot.") {
                let prop = format!("ro.boot.{}", rest);
                if prop != "ro.boot.mode" {
                    self.ctx.props.override_set(&prop, value);
                }
            }
        }
        self.ctx
            .props
            .override_set("ro.boot.mode", boot_mode(bootcfg));
        self.ctx
            .props
            .override_set("ro.boot.gpu", detect_gpu(&self.config.root));
    }

    /// Bootstrap, then dispatch actions and signals until shutdown.
    pub async fn run(&mut self) -> Result<()> {
        self.bootstrap().await?;

        let mut sigchld = signal(SignalKind::child())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sighup = signal(SignalKind::hangup())?;

        info!("entering main loop");

        loop {
            self.pump();

            if let Some(kind) = self.pending_shutdown.take() {
                self.shutdown(kind).await?;
                break;
            }

            // Drain the action queue before suspending.
            if self.actions.execute_next(&self.ctx).await == Dispatch::Dispatched {
                continue;
            }

            let wake = tokio::select! {
                _ = sigchld.recv() => Wake::Child,
                _ = sigterm.recv() => Wake::Terminate,
                _ = sigint.recv() => Wake::Terminate,
                _ = sighup.recv() => Wake::Hangup,
                ev = self.events_rx.recv() => match ev {
                    Some(ev) => Wake::Event(ev),
                    None => Wake::Closed,
                },
                change = self.changes_rx.recv() => match change {
                    Some(change) => Wake::Change(change),
                    None => Wake::Closed,
                },
            };

            match wake {
                Wake::Child => self.reap().await,
                Wake::Terminate => {
                    info!("termination requested");
                    self.pending_shutdown = Some(ShutdownType::PowerOff);
                }
                Wake::Hangup => info!("SIGHUP ignored"),
                Wake::Event(ev) => self.dispatch_event(ev),
                Wake::Change(change) => {
                    self.actions
                        .queue_property_change(&change.key, &change.value, &self.ctx.props);
                }
                Wake::Closed => {
                    warn!("event channel closed, shutting down");
                    self.pending_shutdown = Some(ShutdownType::PowerOff);
                }
            }
        }

        Ok(())
    }

    /// Drain both channels into the action queue without blocking.
    fn pump(&mut self) {
        while let Ok(change) = self.changes_rx.try_recv() {
            self.actions
                .queue_property_change(&change.key, &change.value, &self.ctx.props);
        }
        while let Ok(ev) = self.events_rx.try_recv() {
            self.dispatch_event(ev);
        }
    }

    fn dispatch_event(&mut self, ev: InitEvent) {
        match ev {
            InitEvent::Trigger(name) => self.actions.queue_event(&name, &self.ctx.props),
            InitEvent::Shutdown(kind) => {
                // The first request wins.
                self.pending_shutdown.get_or_insert(kind);
            }
        }
    }

    /// Reap every exited child and feed the supervisor.
    async fn reap(&self) {
        let supervisor = self.ctx.services.supervisor();
        for reaped in supervisor.reap_zombies().await {
            self.ctx.services.on_child_exit(reaped).await;
        }
    }

    async fn shutdown(&mut self, kind: ShutdownType) -> Result<()> {
        info!(kind = ?kind, "shutting down");
        self.ctx.services.stop_all().await;
        sys::sync_disks();

        if self.config.require_pid1 {
            match kind {
                ShutdownType::PowerOff => sys::power_off()?,
                ShutdownType::Reboot => sys::reboot_system()?,
                ShutdownType::RebootBootloader => sys::reboot_bootloader()?,
            }
        } else {
            debug!("not PID 1, skipping the power transition");
        }
        Ok(())
    }

    /// Pump the channels and dispatch one action. Test and tooling entry
    /// point; the main loop does the same with signal handling woven in.
    pub async fn step(&mut self) -> Dispatch {
        self.pump();
        self.actions.execute_next(&self.ctx).await
    }

    /// Dispatch until the queue runs dry. Returns the number of actions
    /// executed.
    pub async fn run_until_idle(&mut self) -> usize {
        let mut dispatched = 0;
        while self.step().await == Dispatch::Dispatched {
            dispatched += 1;
        }
        dispatched
    }

    /// Queue a named event directly.
    pub fn queue_event(&mut self, name: &str) {
        self.actions.queue_event(name, &self.ctx.props);
    }

    pub fn context(&self) -> &InitContext {
        &self.ctx
    }

    pub fn properties(&self) -> &PropertyStore {
        &self.ctx.props
    }

    pub fn services(&self) -> &ServiceManager {
        &self.ctx.services
    }

    pub fn security(&self) -> Option<&SecurityState> {
        self.security.as_ref()
    }

    pub fn uevent_rules(&self) -> &UeventRules {
        &self.uevent_rules
    }
}

/// Derive the boot mode from the kernel command line.
pub fn boot_mode(bootcfg: &BootConfig) -> &'static str {
    match bootcfg.get("sysboot.mode", "normal").as_str() {
        "recovery" => "recovery",
        "charger" => "charger",
        "fastboot" => "fastboot",
        "normal" => "normal",
        other => {
            warn!(mode = other, "unknown boot mode, assuming normal");
            "normal"
        }
    }
}

/// First-stage duties: virtual filesystems, boot configuration, kernel
/// modules. Root pivoting and verified mounts happen before this process
/// exists.
pub fn first_stage(config: &InitConfig) {
    info!("first stage starting");

    if config.mount_filesystems {
        sys::mount_virtual_filesystems();
    }

    let bootcfg = BootConfig::from_root(&config.root);
    let mode = boot_mode(&bootcfg);
    sys::load_kernel_modules(&config.root, mode);

    info!(mode, "first stage complete");
}

/// A runtime confined to `root`, outside PID 1. Used by tests and by
/// operators poking at a staged tree.
pub fn create_test_init(root: PathBuf) -> Result<Init> {
    Init::new(InitConfig {
        root,
        require_pid1: false,
        mount_filesystems: false,
        persist_file: None,
    })
}
