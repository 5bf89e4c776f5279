use crate::cmd;
use crate::driver::{
    ControlPlaneHandle, GuestDriver, GuestRuntimeConfig, GuestSpec, GuestState,
};
use crate::GuestError;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Guest descriptor owned by kapstan itself.
///
/// Unlike the VM driver, the native hypervisor has no configuration document
/// of its own to read back, so this driver records what the guest was booted
/// with and treats that as the actual runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct GuestDescriptor {
    cpus: u32,
    memory_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
}

/// DHCP lease dropped by the hypervisor once the guest acquires an address.
#[derive(Debug, Deserialize)]
struct Lease {
    ip_address: String,
}

/// Native-hypervisor driver: spawns the hypervisor CLI directly and owns the
/// guest descriptor under its machine directory.
pub struct NativeDriver {
    hypervisor: String,
    state_dir: PathBuf,
}

impl NativeDriver {
    pub fn new(hypervisor: impl Into<String>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            hypervisor: hypervisor.into(),
            state_dir: state_dir.into(),
        }
    }

    fn machine_dir(&self) -> PathBuf {
        self.state_dir.join("native")
    }

    fn descriptor_path(&self) -> PathBuf {
        self.machine_dir().join("guest.json")
    }

    fn lease_path(&self) -> PathBuf {
        self.machine_dir().join("lease.json")
    }

    fn pid_path(&self) -> PathBuf {
        self.machine_dir().join("hypervisor.pid")
    }

    fn read_descriptor(&self) -> Result<Option<GuestDescriptor>, GuestError> {
        match std::fs::read_to_string(self.descriptor_path()) {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_descriptor(&self, descriptor: &GuestDescriptor) -> Result<(), GuestError> {
        std::fs::create_dir_all(self.machine_dir())?;
        std::fs::write(self.descriptor_path(), serde_json::to_vec_pretty(descriptor)?)?;
        Ok(())
    }

    fn machine_dir_arg(&self) -> String {
        self.machine_dir().to_string_lossy().into_owned()
    }

    fn ssh_args<'a>(&'a self, dir: &'a str, argv: &[&'a str]) -> Vec<&'a str> {
        let mut args = vec!["ssh", "--machine-dir", dir, "--"];
        args.extend_from_slice(argv);
        args
    }
}

impl GuestDriver for NativeDriver {
    fn name(&self) -> &'static str {
        "native"
    }

    fn state(&self) -> Result<GuestState, GuestError> {
        if !self.descriptor_path().exists() {
            return Ok(GuestState::Absent);
        }
        let pid = match std::fs::read_to_string(self.pid_path()) {
            Ok(raw) => raw.trim().to_owned(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(GuestState::Stopped)
            }
            Err(e) => return Err(e.into()),
        };
        if pid.is_empty() || !pid.chars().all(|c| c.is_ascii_digit()) {
            return Ok(GuestState::Broken);
        }
        if Path::new("/proc").join(&pid).exists() {
            Ok(GuestState::Running)
        } else {
            Ok(GuestState::Stopped)
        }
    }

    fn prepare(&self, spec: &GuestSpec) -> Result<(), GuestError> {
        let previous = self.read_descriptor()?.and_then(|d| d.version);
        self.write_descriptor(&GuestDescriptor {
            cpus: spec.cpus,
            memory_bytes: spec.memory_bytes,
            version: previous,
        })
    }

    fn boot(&self, spec: &GuestSpec) -> Result<(), GuestError> {
        self.prepare(spec)?;

        if self.state()? == GuestState::Running {
            return Ok(());
        }
        let dir = self.machine_dir_arg();
        let cpus = spec.cpus.to_string();
        let memory = spec.memory_bytes.to_string();
        cmd::run(
            &self.hypervisor,
            &[
                "start",
                "--machine-dir",
                &dir,
                "--cpus",
                &cpus,
                "--memory-bytes",
                &memory,
                "--daemonize",
            ],
        )
    }

    fn stop_guest(&self) -> Result<(), GuestError> {
        let dir = self.machine_dir_arg();
        cmd::run(&self.hypervisor, &["stop", "--machine-dir", &dir])
    }

    fn destroy(&self) -> Result<(), GuestError> {
        let dir = self.machine_dir_arg();
        if self.descriptor_path().exists() {
            cmd::run(&self.hypervisor, &["delete", "--machine-dir", &dir])?;
        }
        if self.machine_dir().exists() {
            std::fs::remove_dir_all(self.machine_dir())?;
        }
        Ok(())
    }

    fn exec(&self, argv: &[&str]) -> Result<(), GuestError> {
        let dir = self.machine_dir_arg();
        cmd::run(&self.hypervisor, &self.ssh_args(&dir, argv))
    }

    fn exec_capture(&self, argv: &[&str]) -> Result<String, GuestError> {
        let dir = self.machine_dir_arg();
        cmd::run_capture(&self.hypervisor, &self.ssh_args(&dir, argv))
    }

    fn copy_into(&self, host_path: &Path, guest_path: &str) -> Result<(), GuestError> {
        let dir = self.machine_dir_arg();
        let host = host_path.to_string_lossy();
        cmd::run(
            &self.hypervisor,
            &["push", "--machine-dir", &dir, &host, guest_path],
        )
    }

    fn read_address(&self) -> Result<Option<String>, GuestError> {
        match std::fs::read_to_string(self.lease_path()) {
            Ok(raw) => {
                let lease: Lease = serde_json::from_str(&raw)?;
                Ok(Some(lease.ip_address))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn read_runtime_config(&self) -> Result<Option<GuestRuntimeConfig>, GuestError> {
        Ok(self.read_descriptor()?.map(|d| GuestRuntimeConfig {
            cpus: d.cpus,
            memory_bytes: d.memory_bytes,
        }))
    }

    fn persisted_version(&self) -> Result<Option<Version>, GuestError> {
        let Some(version) = self.read_descriptor()?.and_then(|d| d.version) else {
            return Ok(None);
        };
        Version::parse(version.trim_start_matches('v'))
            .map(Some)
            .map_err(|e| GuestError::Descriptor(format!("bad recorded version: {e}")))
    }

    fn record_version(&self, version: &Version) -> Result<(), GuestError> {
        let mut descriptor = self.read_descriptor()?.unwrap_or_default();
        descriptor.version = Some(format!("v{version}"));
        self.write_descriptor(&descriptor)
    }

    fn install_release(&self, artifact_dir: &Path, _full_version: &str) -> Result<(), GuestError> {
        self.exec(&["sudo", "mkdir", "-p", "/var/lib/rancher/k3s/agent/images"])?;
        self.copy_into(&artifact_dir.join("k3s"), "/tmp/k3s")?;
        self.copy_into(
            &artifact_dir.join("k3s-airgap-images-amd64.tar"),
            "/tmp/k3s-airgap-images-amd64.tar",
        )?;
        self.exec(&["sudo", "install", "-m", "755", "/tmp/k3s", "/usr/local/bin/k3s"])?;
        self.exec(&[
            "sudo",
            "mv",
            "/tmp/k3s-airgap-images-amd64.tar",
            "/var/lib/rancher/k3s/agent/images/",
        ])?;
        Ok(())
    }

    fn clear_cluster_state(&self) -> Result<(), GuestError> {
        self.exec(&[
            "sudo",
            "rm",
            "-rf",
            "/var/lib/rancher/k3s/server/db",
            "/var/lib/rancher/k3s/server/cred",
            "/var/lib/rancher/k3s/server/tls",
        ])
    }

    fn halt_control_plane(&self) -> Result<(), GuestError> {
        if let Err(e) = self.exec(&["sudo", "pkill", "-TERM", "-x", "k3s"]) {
            debug!("no control plane to halt: {e}");
        }
        Ok(())
    }

    fn launch_control_plane(&self, port: u16) -> Result<Box<dyn ControlPlaneHandle>, GuestError> {
        let dir = self.machine_dir_arg();
        let port_arg = port.to_string();
        let argv = [
            "sudo",
            "k3s",
            "server",
            "--https-listen-port",
            port_arg.as_str(),
        ];
        cmd::spawn(&self.hypervisor, &self.ssh_args(&dir, &argv))
    }

    fn read_admin_kubeconfig(&self) -> Result<String, GuestError> {
        self.exec_capture(&["sudo", "cat", "/etc/rancher/k3s/k3s.yaml"])
    }

    fn engine_socket(&self) -> Option<PathBuf> {
        None
    }
}
