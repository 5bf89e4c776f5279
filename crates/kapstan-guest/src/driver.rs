use crate::GuestError;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Desired guest configuration, supplied by the caller at start/reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestSpec {
    pub cpus: u32,
    pub memory_bytes: u64,
    /// Port the k3s API server should listen on.
    pub port: u16,
    /// Build-qualified version tag, e.g. `v1.23.6+k3s1`.
    pub version: String,
}

/// Runtime configuration read back from the guest's own descriptor.
///
/// This reflects what the guest is actually running with, not what was last
/// requested; restart-reason diffing compares the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestRuntimeConfig {
    pub cpus: u32,
    pub memory_bytes: u64,
}

/// Observed guest run-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestState {
    /// No guest is registered with the backing driver.
    Absent,
    Stopped,
    Running,
    /// The driver reports the guest exists but cannot be used.
    Broken,
}

/// Exit information for a finished control-plane process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatusInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitStatusInfo {
    /// A zero exit or a SIGTERM-driven death both count as a clean shutdown.
    pub fn is_clean(&self) -> bool {
        self.code == Some(0) || self.signal == Some(15)
    }
}

/// A running control-plane process, owned by the lifecycle controller.
pub trait ControlPlaneHandle: Send {
    /// Block until the process exits.
    fn wait(&mut self) -> Result<ExitStatusInfo, GuestError>;

    /// Terminate the process; `wait` observes the resulting exit.
    fn kill(&mut self) -> Result<(), GuestError>;
}

/// Capability contract a virtualization backend must satisfy.
///
/// The lifecycle state machine, progress aggregation, and restart-reason
/// diffing all live above this trait; drivers only provide the mechanics.
pub trait GuestDriver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Current guest run-state. Failures to query are reported as
    /// [`GuestState::Absent`] by drivers whose status command is unreliable
    /// while the guest is unregistered.
    fn state(&self) -> Result<GuestState, GuestError>;

    /// Write the desired guest configuration without booting. Safe to run
    /// while artifacts are still downloading; `boot` picks the result up.
    fn prepare(&self, spec: &GuestSpec) -> Result<(), GuestError>;

    /// Provision (if needed) and boot the guest. Booting an already-running
    /// guest is a no-op.
    fn boot(&self, spec: &GuestSpec) -> Result<(), GuestError>;

    /// Stop the guest. Only called when the guest is actually running.
    fn stop_guest(&self) -> Result<(), GuestError>;

    /// Destroy the guest and its backing storage.
    fn destroy(&self) -> Result<(), GuestError>;

    /// Run a command inside the guest.
    fn exec(&self, argv: &[&str]) -> Result<(), GuestError>;

    /// Run a command inside the guest, capturing stdout.
    fn exec_capture(&self, argv: &[&str]) -> Result<String, GuestError>;

    /// Copy a host file into the guest.
    fn copy_into(&self, host_path: &Path, guest_path: &str) -> Result<(), GuestError>;

    /// The guest's current IP address, when one is assigned yet.
    fn read_address(&self) -> Result<Option<String>, GuestError>;

    /// The guest's actual runtime configuration, when a descriptor exists.
    fn read_runtime_config(&self) -> Result<Option<GuestRuntimeConfig>, GuestError>;

    /// The k3s version recorded for the previous activation, if any.
    fn persisted_version(&self) -> Result<Option<Version>, GuestError>;

    /// Record the active k3s version in the guest descriptor.
    fn record_version(&self, version: &Version) -> Result<(), GuestError>;

    /// Copy/activate a verified artifact set inside the guest.
    fn install_release(&self, artifact_dir: &Path, full_version: &str) -> Result<(), GuestError>;

    /// Delete persisted cluster state (used on version downgrade).
    fn clear_cluster_state(&self) -> Result<(), GuestError>;

    /// Best-effort termination of a control plane left over from a previous
    /// run; missing process is not an error.
    fn halt_control_plane(&self) -> Result<(), GuestError>;

    /// Launch the k3s server inside the guest.
    fn launch_control_plane(&self, port: u16) -> Result<Box<dyn ControlPlaneHandle>, GuestError>;

    /// The admin kubeconfig generated by the running control plane.
    fn read_admin_kubeconfig(&self) -> Result<String, GuestError>;

    /// Host-side container-engine socket, for drivers that forward one.
    /// Returning `None` skips engine-context reconciliation.
    fn engine_socket(&self) -> Option<std::path::PathBuf>;
}

impl<T: GuestDriver + ?Sized> GuestDriver for Box<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn state(&self) -> Result<GuestState, GuestError> {
        (**self).state()
    }

    fn prepare(&self, spec: &GuestSpec) -> Result<(), GuestError> {
        (**self).prepare(spec)
    }

    fn boot(&self, spec: &GuestSpec) -> Result<(), GuestError> {
        (**self).boot(spec)
    }

    fn stop_guest(&self) -> Result<(), GuestError> {
        (**self).stop_guest()
    }

    fn destroy(&self) -> Result<(), GuestError> {
        (**self).destroy()
    }

    fn exec(&self, argv: &[&str]) -> Result<(), GuestError> {
        (**self).exec(argv)
    }

    fn exec_capture(&self, argv: &[&str]) -> Result<String, GuestError> {
        (**self).exec_capture(argv)
    }

    fn copy_into(&self, host_path: &Path, guest_path: &str) -> Result<(), GuestError> {
        (**self).copy_into(host_path, guest_path)
    }

    fn read_address(&self) -> Result<Option<String>, GuestError> {
        (**self).read_address()
    }

    fn read_runtime_config(&self) -> Result<Option<GuestRuntimeConfig>, GuestError> {
        (**self).read_runtime_config()
    }

    fn persisted_version(&self) -> Result<Option<Version>, GuestError> {
        (**self).persisted_version()
    }

    fn record_version(&self, version: &Version) -> Result<(), GuestError> {
        (**self).record_version(version)
    }

    fn install_release(&self, artifact_dir: &Path, full_version: &str) -> Result<(), GuestError> {
        (**self).install_release(artifact_dir, full_version)
    }

    fn clear_cluster_state(&self) -> Result<(), GuestError> {
        (**self).clear_cluster_state()
    }

    fn halt_control_plane(&self) -> Result<(), GuestError> {
        (**self).halt_control_plane()
    }

    fn launch_control_plane(&self, port: u16) -> Result<Box<dyn ControlPlaneHandle>, GuestError> {
        (**self).launch_control_plane(port)
    }

    fn read_admin_kubeconfig(&self) -> Result<String, GuestError> {
        (**self).read_admin_kubeconfig()
    }

    fn engine_socket(&self) -> Option<std::path::PathBuf> {
        (**self).engine_socket()
    }
}
