use crate::driver::{
    ControlPlaneHandle, ExitStatusInfo, GuestDriver, GuestRuntimeConfig, GuestSpec, GuestState,
};
use crate::GuestError;
use semver::Version;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};

/// In-memory driver for exercising the lifecycle controller in tests.
///
/// Records every call and lets a test script the guest's address, runtime
/// configuration, and control-plane exits.
#[derive(Clone, Default)]
pub struct MockDriver {
    inner: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    state: GuestStateCell,
    prepares: Vec<GuestSpec>,
    boots: Vec<GuestSpec>,
    execs: Vec<Vec<String>>,
    installs: Vec<String>,
    stop_calls: usize,
    destroy_calls: usize,
    clear_state_calls: usize,
    halt_calls: usize,
    address: Option<String>,
    runtime_config: Option<GuestRuntimeConfig>,
    persisted: Option<Version>,
    kubeconfig: String,
    engine_socket: Option<PathBuf>,
    exit_tx: Option<Sender<ExitStatusInfo>>,
}

#[derive(Default)]
struct GuestStateCell(Option<GuestState>);

impl GuestStateCell {
    fn get(&self) -> GuestState {
        self.0.unwrap_or(GuestState::Absent)
    }

    fn set(&mut self, state: GuestState) {
        self.0 = Some(state);
    }
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn set_address(&self, address: Option<&str>) {
        self.lock().address = address.map(ToOwned::to_owned);
    }

    pub fn set_runtime_config(&self, config: Option<GuestRuntimeConfig>) {
        self.lock().runtime_config = config;
    }

    pub fn set_persisted_version(&self, version: Option<Version>) {
        self.lock().persisted = version;
    }

    pub fn set_kubeconfig(&self, text: &str) {
        self.lock().kubeconfig = text.to_owned();
    }

    pub fn set_engine_socket(&self, socket: Option<PathBuf>) {
        self.lock().engine_socket = socket;
    }

    /// Make the scripted control plane exit with the given status.
    pub fn trigger_exit(&self, info: ExitStatusInfo) {
        if let Some(tx) = self.lock().exit_tx.take() {
            let _ = tx.send(info);
        }
    }

    pub fn prepares(&self) -> Vec<GuestSpec> {
        self.lock().prepares.clone()
    }

    pub fn boots(&self) -> Vec<GuestSpec> {
        self.lock().boots.clone()
    }

    pub fn stop_calls(&self) -> usize {
        self.lock().stop_calls
    }

    pub fn destroy_calls(&self) -> usize {
        self.lock().destroy_calls
    }

    pub fn clear_state_calls(&self) -> usize {
        self.lock().clear_state_calls
    }

    pub fn halt_calls(&self) -> usize {
        self.lock().halt_calls
    }

    pub fn installs(&self) -> Vec<String> {
        self.lock().installs.clone()
    }

    pub fn execs(&self) -> Vec<Vec<String>> {
        self.lock().execs.clone()
    }

    pub fn force_state(&self, state: GuestState) {
        self.lock().state.set(state);
    }
}

struct MockHandle {
    rx: Receiver<ExitStatusInfo>,
    tx: Sender<ExitStatusInfo>,
}

impl ControlPlaneHandle for MockHandle {
    fn wait(&mut self) -> Result<ExitStatusInfo, GuestError> {
        Ok(self.rx.recv().unwrap_or(ExitStatusInfo {
            code: Some(0),
            signal: None,
        }))
    }

    fn kill(&mut self) -> Result<(), GuestError> {
        let _ = self.tx.send(ExitStatusInfo { code: None, signal: Some(15) });
        Ok(())
    }
}

impl GuestDriver for MockDriver {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn state(&self) -> Result<GuestState, GuestError> {
        Ok(self.lock().state.get())
    }

    fn prepare(&self, spec: &GuestSpec) -> Result<(), GuestError> {
        self.lock().prepares.push(spec.clone());
        Ok(())
    }

    fn boot(&self, spec: &GuestSpec) -> Result<(), GuestError> {
        let mut inner = self.lock();
        inner.boots.push(spec.clone());
        inner.state.set(GuestState::Running);
        inner.runtime_config = Some(GuestRuntimeConfig {
            cpus: spec.cpus,
            memory_bytes: spec.memory_bytes,
        });
        Ok(())
    }

    fn stop_guest(&self) -> Result<(), GuestError> {
        let mut inner = self.lock();
        inner.stop_calls += 1;
        inner.state.set(GuestState::Stopped);
        Ok(())
    }

    fn destroy(&self) -> Result<(), GuestError> {
        let mut inner = self.lock();
        inner.destroy_calls += 1;
        inner.state.set(GuestState::Absent);
        inner.runtime_config = None;
        inner.persisted = None;
        Ok(())
    }

    fn exec(&self, argv: &[&str]) -> Result<(), GuestError> {
        self.lock()
            .execs
            .push(argv.iter().map(|&s| s.to_owned()).collect());
        Ok(())
    }

    fn exec_capture(&self, argv: &[&str]) -> Result<String, GuestError> {
        self.exec(argv)?;
        Ok(String::new())
    }

    fn copy_into(&self, _host_path: &Path, _guest_path: &str) -> Result<(), GuestError> {
        Ok(())
    }

    fn read_address(&self) -> Result<Option<String>, GuestError> {
        Ok(self.lock().address.clone())
    }

    fn read_runtime_config(&self) -> Result<Option<GuestRuntimeConfig>, GuestError> {
        Ok(self.lock().runtime_config)
    }

    fn persisted_version(&self) -> Result<Option<Version>, GuestError> {
        Ok(self.lock().persisted.clone())
    }

    fn record_version(&self, version: &Version) -> Result<(), GuestError> {
        self.lock().persisted = Some(version.clone());
        Ok(())
    }

    fn install_release(&self, _artifact_dir: &Path, full_version: &str) -> Result<(), GuestError> {
        self.lock().installs.push(full_version.to_owned());
        Ok(())
    }

    fn clear_cluster_state(&self) -> Result<(), GuestError> {
        self.lock().clear_state_calls += 1;
        Ok(())
    }

    fn halt_control_plane(&self) -> Result<(), GuestError> {
        let mut inner = self.lock();
        inner.halt_calls += 1;
        // A TERM to the control plane resolves any pending wait.
        if let Some(tx) = inner.exit_tx.take() {
            let _ = tx.send(ExitStatusInfo { code: None, signal: Some(15) });
        }
        Ok(())
    }

    fn launch_control_plane(&self, _port: u16) -> Result<Box<dyn ControlPlaneHandle>, GuestError> {
        let (tx, rx) = std::sync::mpsc::channel();
        self.lock().exit_tx = Some(tx.clone());
        Ok(Box::new(MockHandle { rx, tx }))
    }

    fn read_admin_kubeconfig(&self) -> Result<String, GuestError> {
        Ok(self.lock().kubeconfig.clone())
    }

    fn engine_socket(&self) -> Option<PathBuf> {
        self.lock().engine_socket.clone()
    }
}
