//! Service manager: the registry of service definitions and the
//! supervisor-driven lifecycle around them.
//!
//! Every state transition is mirrored into the property store as
//! `init.svc.<name>` so configuration scripts can condition on service
//! status.

use crate::error::{Error, Result};
use crate::init::{InitEvent, ShutdownType};
use crate::process::{ProcessSupervisor, ReapedChild};
use crate::properties::PropertyStore;
use crate::service::{ServiceDefinition, ServiceInstance, ServiceState, ServiceStatus};
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Minimum interval between restarts of the same service.
pub const RESTART_BACKOFF: Duration = Duration::from_secs(5);

/// Bounded wait between SIGTERM and SIGKILL on stop.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// A critical service crashing this many times inside the window is fatal.
const CRITICAL_CRASH_THRESHOLD: usize = 4;
const CRITICAL_CRASH_WINDOW_SECS: i64 = 240;

/// Diagnostic property naming the critical service that took the system down.
pub const CRITICAL_FAULT_PROP: &str = "init.err.critical";

/// Orchestrates registered services.
pub struct ServiceManager {
    definitions: Arc<RwLock<HashMap<String, Arc<ServiceDefinition>>>>,
    instances: Arc<RwLock<HashMap<String, ServiceInstance>>>,
    supervisor: Arc<ProcessSupervisor>,
    props: PropertyStore,
    root: PathBuf,
    events: UnboundedSender<InitEvent>,
    restart_backoff: Duration,
}

impl Clone for ServiceManager {
    fn clone(&self) -> Self {
        Self {
            definitions: Arc::clone(&self.definitions),
            instances: Arc::clone(&self.instances),
            supervisor: Arc::clone(&self.supervisor),
            props: self.props.clone(),
            root: self.root.clone(),
            events: self.events.clone(),
            restart_backoff: self.restart_backoff,
        }
    }
}

impl ServiceManager {
    pub fn new(props: PropertyStore, root: PathBuf, events: UnboundedSender<InitEvent>) -> Self {
        Self {
            definitions: Arc::new(RwLock::new(HashMap::new())),
            instances: Arc::new(RwLock::new(HashMap::new())),
            supervisor: Arc::new(ProcessSupervisor::new()),
            props,
            root,
            events,
            restart_backoff: RESTART_BACKOFF,
        }
    }

    /// Shorten the restart backoff, for tests.
    #[doc(hidden)]
    pub fn set_restart_backoff(&mut self, backoff: Duration) {
        self.restart_backoff = backoff;
    }

    /// Register a parsed service definition. Conflicting redefinitions are
    /// an error.
    pub async fn register(&self, def: ServiceDefinition) -> Result<()> {
        let name = def.name.clone();
        if self.definitions.read().await.contains_key(&name) {
            return Err(Error::ServiceAlreadyExists(name));
        }

        let instance = ServiceInstance::new(&name, def.disabled);
        self.mirror(&name, instance.state);

        self.definitions
            .write()
            .await
            .insert(name.clone(), Arc::new(def));
        self.instances.write().await.insert(name, instance);
        Ok(())
    }

    /// Register a batch of definitions, logging duplicates.
    pub async fn register_all(&self, defs: Vec<ServiceDefinition>) {
        for def in defs {
            let name = def.name.clone();
            if let Err(e) = self.register(def).await {
                error!(service = %name, error = %e, "failed to register service");
            }
        }
    }

    /// Start a service by name.
    ///
    /// A `disabled` declaration only excludes the service from class
    /// starts; naming it directly always works.
    pub async fn start(&self, name: &str) -> Result<()> {
        let def = self.definition(name).await?;

        {
            let instances = self.instances.read().await;
            if let Some(instance) = instances.get(name) {
                if instance.is_active() {
                    info!(service = %name, "service is already running");
                    return Ok(());
                }
            }
        }

        // Starting is transient within this call; the mirror property only
        // moves once the spawn result is known.
        {
            let mut instances = self.instances.write().await;
            if let Some(instance) = instances.get_mut(name) {
                instance.state = ServiceState::Starting;
            }
        }
        info!(service = %name, "starting service");

        match self.supervisor.spawn(&def, &self.root).await {
            Ok(pid) => {
                let mut instances = self.instances.write().await;
                if let Some(instance) = instances.get_mut(name) {
                    instance.pid = Some(pid);
                    instance.started_at = Some(Utc::now());
                    instance.state = ServiceState::Running;
                    instance.exit_status = None;
                }
                drop(instances);
                self.mirror(name, ServiceState::Running);
                info!(service = %name, pid, "service running");
                Ok(())
            }
            Err(e) => {
                warn!(service = %name, error = %e, "service failed to start");
                self.set_state(name, ServiceState::Restarting).await;
                self.schedule_restart(name);
                Err(Error::ServiceStartFailed {
                    name: name.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Stop a service: SIGTERM, bounded wait, SIGKILL. Cancels a pending
    /// restart when the service is in backoff.
    pub async fn stop(&self, name: &str) -> Result<()> {
        self.definition(name).await?;

        let pid = {
            let instances = self.instances.read().await;
            let instance = instances
                .get(name)
                .ok_or_else(|| Error::ServiceNotFound(name.to_string()))?;
            if instance.state == ServiceState::Restarting {
                None
            } else if !instance.is_active() {
                info!(service = %name, "service is not running");
                return Ok(());
            } else {
                instance.pid
            }
        };

        info!(service = %name, "stopping service");

        if let Some(pid) = pid {
            match self.supervisor.stop(pid, STOP_TIMEOUT).await {
                Ok(status) => {
                    let mut instances = self.instances.write().await;
                    if let Some(instance) = instances.get_mut(name) {
                        instance.pid = None;
                        instance.stopped_at = Some(Utc::now());
                        instance.exit_status = Some(status);
                        instance.state = ServiceState::Stopped;
                    }
                    drop(instances);
                    self.mirror(name, ServiceState::Stopped);
                    info!(service = %name, "service stopped");
                    Ok(())
                }
                Err(e) => {
                    error!(service = %name, error = %e, "failed to stop service");
                    Err(Error::ServiceStopFailed {
                        name: name.to_string(),
                        reason: e.to_string(),
                    })
                }
            }
        } else {
            // Not running or waiting out a backoff; pin it stopped so a
            // scheduled restart gives up.
            self.set_state(name, ServiceState::Stopped).await;
            Ok(())
        }
    }

    /// Restart a service.
    pub async fn restart(&self, name: &str) -> Result<()> {
        self.stop(name).await?;
        self.start(name).await
    }

    /// Start every non-disabled service of a class.
    pub async fn start_class(&self, class: &str) {
        for def in self.class_members(class).await {
            if def.disabled {
                debug!(service = %def.name, "skipping disabled service in class start");
                continue;
            }
            if let Err(e) = self.start(&def.name).await {
                error!(service = %def.name, error = %e, "class start failed");
            }
        }
    }

    /// Stop every service of a class.
    pub async fn stop_class(&self, class: &str) {
        for def in self.class_members(class).await {
            if let Err(e) = self.stop(&def.name).await {
                error!(service = %def.name, error = %e, "class stop failed");
            }
        }
    }

    /// Stop every active service, for shutdown.
    pub async fn stop_all(&self) {
        let running: Vec<String> = {
            let instances = self.instances.read().await;
            instances
                .iter()
                .filter(|(_, instance)| instance.is_active())
                .map(|(name, _)| name.clone())
                .collect()
        };
        for name in running {
            if let Err(e) = self.stop(&name).await {
                error!(service = %name, error = %e, "failed to stop service during shutdown");
            }
        }
    }

    /// React to a reaped child. Applies the restart policy and the
    /// critical-service storm escalation.
    pub async fn on_child_exit(&self, reaped: ReapedChild) {
        let Some(name) = reaped.service else {
            debug!(pid = reaped.status.pid, "reaped unowned process");
            return;
        };
        let status = reaped.status;

        info!(
            service = %name,
            pid = status.pid,
            code = ?status.code,
            signal = ?status.signal,
            "service process exited"
        );

        let Ok(def) = self.definition(&name).await else {
            return;
        };

        // Ignore exits already accounted for by an explicit stop.
        let was_active = {
            let mut instances = self.instances.write().await;
            let Some(instance) = instances.get_mut(&name) else {
                return;
            };
            let was_active = instance.is_active() && instance.pid == Some(status.pid);
            if was_active {
                instance.pid = None;
                instance.stopped_at = Some(Utc::now());
                instance.exit_status = Some(status);
            }
            was_active
        };
        if !was_active {
            return;
        }

        if def.oneshot && status.success() {
            self.set_state(&name, ServiceState::Stopped).await;
            return;
        }

        // Crash bookkeeping for the storm window.
        let storm = {
            let mut instances = self.instances.write().await;
            let Some(instance) = instances.get_mut(&name) else {
                return;
            };
            let now = Utc::now();
            instance.crashes.push_back(now);
            while let Some(first) = instance.crashes.front() {
                if now.signed_duration_since(*first).num_seconds() > CRITICAL_CRASH_WINDOW_SECS {
                    instance.crashes.pop_front();
                } else {
                    break;
                }
            }
            instance.restart_count += 1;
            instance.crashes.len() >= CRITICAL_CRASH_THRESHOLD
        };

        if def.critical && storm {
            error!(service = %name, "critical service in a restart storm, rebooting to bootloader");
            self.props.override_set(CRITICAL_FAULT_PROP, &name);
            self.set_state(&name, ServiceState::Fatal).await;
            let _ = self
                .events
                .send(InitEvent::Shutdown(ShutdownType::RebootBootloader));
            return;
        }

        self.set_state(&name, ServiceState::Restarting).await;
        self.schedule_restart(&name);
    }

    /// Status snapshot for one service.
    pub async fn status(&self, name: &str) -> Result<ServiceStatus> {
        let definitions = self.definitions.read().await;
        let instances = self.instances.read().await;
        let def = definitions
            .get(name)
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))?;
        let instance = instances
            .get(name)
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))?;
        Ok(ServiceStatus::from_service(def, instance))
    }

    /// Status snapshots for every registered service.
    pub async fn list(&self) -> Vec<ServiceStatus> {
        let definitions = self.definitions.read().await;
        let instances = self.instances.read().await;
        definitions
            .iter()
            .filter_map(|(name, def)| {
                instances
                    .get(name)
                    .map(|instance| ServiceStatus::from_service(def, instance))
            })
            .collect()
    }

    /// The process supervisor, for the orchestrator's reap loop.
    pub fn supervisor(&self) -> Arc<ProcessSupervisor> {
        Arc::clone(&self.supervisor)
    }

    async fn definition(&self, name: &str) -> Result<Arc<ServiceDefinition>> {
        self.definitions
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))
    }

    async fn class_members(&self, class: &str) -> Vec<Arc<ServiceDefinition>> {
        self.definitions
            .read()
            .await
            .values()
            .filter(|def| def.class == class)
            .cloned()
            .collect()
    }

    async fn set_state(&self, name: &str, state: ServiceState) {
        {
            let mut instances = self.instances.write().await;
            if let Some(instance) = instances.get_mut(name) {
                instance.state = state;
            }
        }
        self.mirror(name, state);
    }

    fn mirror(&self, name: &str, state: ServiceState) {
        self.props
            .override_set(&format!("init.svc.{}", name), state.mirror_value());
    }

    /// Re-enter the start sequence after the backoff, unless the service
    /// was stopped in the meantime.
    fn schedule_restart(&self, name: &str) {
        let manager = self.clone();
        let name = name.to_string();
        let backoff = self.restart_backoff;
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            let still_wanted = {
                let instances = manager.instances.read().await;
                instances
                    .get(&name)
                    .map(|i| i.state == ServiceState::Restarting)
                    .unwrap_or(false)
            };
            if !still_wanted {
                debug!(service = %name, "restart cancelled");
                return;
            }
            info!(service = %name, "restarting service after backoff");
            if let Err(e) = manager.start(&name).await {
                error!(service = %name, error = %e, "restart failed");
            }
        });
    }
}
