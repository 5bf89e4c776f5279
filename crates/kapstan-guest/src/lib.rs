//! Guest drivers for kapstan.
//!
//! A guest is the virtual machine (or hypervisor-backed instance) that runs
//! the k3s control plane. Two structurally different drivers implement one
//! [`GuestDriver`] contract: [`VmDriver`] delegates to an external VM-manager
//! CLI and reads the manager's own machine descriptor back, while
//! [`NativeDriver`] spawns a hypervisor directly and owns its descriptor.
//! The shared lifecycle state machine in `kapstan-core` is generic over this
//! trait, so the drivers stay free of duplicated orchestration logic.

pub mod cmd;
pub mod driver;
pub mod mock;
pub mod native;
pub mod vm;

pub use driver::{
    ControlPlaneHandle, ExitStatusInfo, GuestDriver, GuestRuntimeConfig, GuestSpec, GuestState,
};
pub use mock::MockDriver;
pub use native::NativeDriver;
pub use vm::VmDriver;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GuestError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("command `{command}` failed with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("guest descriptor error: {0}")]
    Descriptor(String),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("control plane is not running")]
    NotRunning,
}
