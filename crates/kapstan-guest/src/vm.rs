use crate::cmd;
use crate::driver::{
    ControlPlaneHandle, GuestDriver, GuestRuntimeConfig, GuestSpec, GuestState,
};
use crate::GuestError;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Machine configuration document shared with the VM manager.
///
/// The manager owns the copy in the machine directory; the `k3s` section is
/// not interpreted by the manager and carries kapstan's own state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct VmConfig {
    #[serde(default)]
    cpus: u32,
    #[serde(default)]
    memory: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    k3s: Option<K3sSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct K3sSection {
    version: String,
}

/// One entry from `<cli> list --json` (one JSON object per line).
#[derive(Debug, Deserialize)]
struct VmListEntry {
    name: String,
    status: String,
}

/// Full-VM driver delegating to an external VM-manager CLI.
///
/// The manager is the source of truth for the machine's actual runtime
/// configuration; kapstan reads the machine document back rather than
/// trusting its own last request.
pub struct VmDriver {
    cli: String,
    machine: String,
    state_dir: PathBuf,
}

impl VmDriver {
    pub fn new(cli: impl Into<String>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            cli: cli.into(),
            machine: "kapstan".to_owned(),
            state_dir: state_dir.into(),
        }
    }

    fn desired_config_path(&self) -> PathBuf {
        self.state_dir.join("vm").join("_config").join(format!("{}.yaml", self.machine))
    }

    fn machine_config_path(&self) -> PathBuf {
        self.state_dir.join("vm").join(&self.machine).join("machine.yaml")
    }

    fn read_machine_config(&self) -> Result<Option<VmConfig>, GuestError> {
        match std::fs::read_to_string(self.machine_config_path()) {
            Ok(raw) => Ok(Some(serde_yaml::from_str(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_machine_config(&self, config: &VmConfig) -> Result<(), GuestError> {
        let path = self.machine_config_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_yaml::to_string(config)?)?;
        Ok(())
    }

    /// The configuration to hand the manager, keeping the previously
    /// recorded k3s version; the controller updates it after the new
    /// release is activated.
    fn desired_config(&self, spec: &GuestSpec) -> Result<VmConfig, GuestError> {
        let previous = self.read_machine_config()?.and_then(|c| c.k3s);
        Ok(VmConfig {
            cpus: spec.cpus,
            memory: spec.memory_bytes,
            k3s: previous,
        })
    }

    fn shell_args<'a>(&'a self, argv: &[&'a str]) -> Vec<&'a str> {
        let mut args = vec!["shell", self.machine.as_str()];
        args.extend_from_slice(argv);
        args
    }
}

impl GuestDriver for VmDriver {
    fn name(&self) -> &'static str {
        "vm"
    }

    fn state(&self) -> Result<GuestState, GuestError> {
        let text = match cmd::run_capture(&self.cli, &["list", "--json"]) {
            Ok(text) => text,
            Err(e) => {
                debug!("could not list machines, assuming guest is absent: {e}");
                return Ok(GuestState::Absent);
            }
        };
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let entry: VmListEntry = match serde_json::from_str(line) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("unparsable machine list entry, skipping: {e}");
                    continue;
                }
            };
            if entry.name == self.machine {
                return Ok(match entry.status.as_str() {
                    "Running" => GuestState::Running,
                    "Stopped" => GuestState::Stopped,
                    _ => GuestState::Broken,
                });
            }
        }
        Ok(GuestState::Absent)
    }

    fn prepare(&self, spec: &GuestSpec) -> Result<(), GuestError> {
        let config = self.desired_config(spec)?;
        let config_path = self.desired_config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&config_path, serde_yaml::to_string(&config)?)?;
        Ok(())
    }

    fn boot(&self, spec: &GuestSpec) -> Result<(), GuestError> {
        self.prepare(spec)?;
        let config = self.desired_config(spec)?;
        let config_path = self.desired_config_path();

        let state = self.state()?;
        if state == GuestState::Running {
            return Ok(());
        }
        // A registered machine is started by name; an unregistered one is
        // registered from the config document.
        let target = if state == GuestState::Absent {
            config_path.to_string_lossy().into_owned()
        } else {
            self.machine.clone()
        };
        cmd::run(&self.cli, &["start", "--tty=false", &target])?;
        self.write_machine_config(&config)?;
        Ok(())
    }

    fn stop_guest(&self) -> Result<(), GuestError> {
        cmd::run(&self.cli, &["stop", &self.machine])
    }

    fn destroy(&self) -> Result<(), GuestError> {
        cmd::run(&self.cli, &["delete", &self.machine])?;
        let machine_dir = self.state_dir.join("vm").join(&self.machine);
        if machine_dir.exists() {
            std::fs::remove_dir_all(machine_dir)?;
        }
        Ok(())
    }

    fn exec(&self, argv: &[&str]) -> Result<(), GuestError> {
        cmd::run(&self.cli, &self.shell_args(argv))
    }

    fn exec_capture(&self, argv: &[&str]) -> Result<String, GuestError> {
        cmd::run_capture(&self.cli, &self.shell_args(argv))
    }

    fn copy_into(&self, host_path: &Path, guest_path: &str) -> Result<(), GuestError> {
        let host = host_path.to_string_lossy();
        let target = format!("{}:{guest_path}", self.machine);
        cmd::run(&self.cli, &["copy", &host, &target])
    }

    fn read_address(&self) -> Result<Option<String>, GuestError> {
        let trie = self.exec_capture(&["cat", "/proc/net/fib_trie"])?;
        Ok(parse_fib_trie(&trie))
    }

    fn read_runtime_config(&self) -> Result<Option<GuestRuntimeConfig>, GuestError> {
        Ok(self.read_machine_config()?.map(|c| GuestRuntimeConfig {
            cpus: c.cpus,
            memory_bytes: c.memory,
        }))
    }

    fn persisted_version(&self) -> Result<Option<Version>, GuestError> {
        let Some(config) = self.read_machine_config()? else {
            return Ok(None);
        };
        let Some(k3s) = config.k3s else {
            return Ok(None);
        };
        Version::parse(k3s.version.trim_start_matches('v'))
            .map(Some)
            .map_err(|e| GuestError::Descriptor(format!("bad recorded version: {e}")))
    }

    fn record_version(&self, version: &Version) -> Result<(), GuestError> {
        let mut config = self.read_machine_config()?.unwrap_or_default();
        config.k3s = Some(K3sSection { version: format!("v{version}") });
        self.write_machine_config(&config)
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
        // pkill exits non-zero when nothing matched; that is fine here.
        if let Err(e) = self.exec(&["sudo", "pkill", "-TERM", "-x", "k3s"]) {
            debug!("no control plane to halt: {e}");
        }
        Ok(())
    }

    fn launch_control_plane(&self, port: u16) -> Result<Box<dyn ControlPlaneHandle>, GuestError> {
        let port_arg = port.to_string();
        let argv = [
            "sudo",
            "k3s",
            "server",
            "--https-listen-port",
            port_arg.as_str(),
        ];
        cmd::spawn(&self.cli, &self.shell_args(&argv))
    }

    fn read_admin_kubeconfig(&self) -> Result<String, GuestError> {
        self.exec_capture(&["sudo", "cat", "/etc/rancher/k3s/k3s.yaml"])
    }

    fn engine_socket(&self) -> Option<PathBuf> {
        Some(self.state_dir.join("vm").join("docker.sock"))
    }
}

/// Find the guest's interface address in `/proc/net/fib_trie` output.
///
/// Interface addresses are the lines directly above a `/32 host LOCAL` line;
/// of those, the ones with the shortest indent belong to the primary
/// interface rather than CNI bridges. Loopback addresses are rejected.
fn parse_fib_trie(text: &str) -> Option<String> {
    let lines: Vec<&str> = text.lines().collect();
    let mut candidates: Vec<(usize, String)> = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        let followed_by_local = lines
            .get(i + 1)
            .is_some_and(|next| next.contains("/32 host LOCAL"));
        if !followed_by_local {
            continue;
        }
        let indent = line.len() - line.trim_start().len();
        let address = line
            .trim_start()
            .trim_start_matches("|--")
            .trim()
            .to_owned();
        if address.starts_with("127.") || address.is_empty() {
            continue;
        }
        candidates.push((indent, address));
    }
    let min_indent = candidates.iter().map(|(indent, _)| *indent).min()?;
    candidates
        .into_iter()
        .find(|(indent, _)| *indent == min_indent)
        .map(|(_, address)| address)
}
