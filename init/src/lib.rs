//! sysboot - a user-space process-1 for Linux-class devices.
//!
//! The first user process: it prepares the root environment, applies
//! security policy, establishes the device property namespace and brings
//! up the long-lived services declared in rc configuration.
//!
//! # Architecture
//!
//! The second-stage runtime is built from a handful of components:
//!
//! - **PropertyStore**: the global key/value namespace with a persistent
//!   layer and change notification
//! - **Parser**: the rc-language reader producing trigger blocks and
//!   service definitions
//! - **ActionManager**: the event-driven dispatcher matching declared
//!   conditions against boot events and property changes
//! - **ServiceManager** / **ProcessSupervisor**: fork/exec with privilege
//!   reduction, restart policy and status mirroring
//! - **UeventRules**: pattern-matched device-node permissions
//! - **Init**: the orchestrator sequencing bootstrap and the main loop
//!
//! # Example
//!
//! ```no_run
//! use sysboot_init::{Init, InitConfig};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let mut init = Init::new(InitConfig::default())?;
//!     init.run().await?;
//!     Ok(())
//! }
//! ```

pub mod actions;
pub mod builtins;
pub mod capabilities;
pub mod error;
pub mod init;
pub mod manager;
pub mod process;
pub mod properties;
pub mod rc;
pub mod selinux;
pub mod service;
pub mod sys;
pub mod uevent;
pub mod util;

// Re-export the main types
pub use actions::{ActionManager, Dispatch};
pub use error::{Error, Result};
pub use init::{
    boot_mode, create_test_init, first_stage, Init, InitConfig, InitContext, InitEvent,
    ShutdownType, BOOT_EVENTS,
};
pub use manager::ServiceManager;
pub use process::ProcessSupervisor;
pub use properties::{PropertyChange, PropertyStore};
pub use rc::{Command, Parser, TriggerBlock, TriggerCondition};
pub use selinux::SecurityState;
pub use service::{
    ExitStatus, ServiceDefinition, ServiceInstance, ServiceState, ServiceStatus, SocketConfig,
};
pub use uevent::UeventRules;
