//! The lifecycle state machine.
//!
//! One controller owns one guest. All public operations are meant to be
//! called from a single logical owner; the `Action` guard only exists
//! because the control plane's exit handler calls [`LifecycleController::stop`]
//! on its own thread and must not race a user-initiated stop.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use kapstan_artifact::ArtifactFetcher;
use kapstan_catalog::{CatalogError, VersionCatalog};
use kapstan_guest::{ControlPlaneHandle, ExitStatusInfo, GuestDriver, GuestSpec, GuestState};
use kapstan_kubecfg::kubeconfig::ContextSelector;
use kapstan_kubecfg::{EngineContextReconciler, KubeconfigReconciler};
use semver::Version;
use tracing::{debug, info, warn};

use crate::probe::ReadinessProbe;
use crate::progress::{Progress, ProgressTimer};
use crate::CoreError;

const GIB: f64 = (1u64 << 30) as f64;

/// What the user wants the guest to look like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestConfiguration {
    pub cpus: u32,
    pub memory_bytes: u64,
    /// Host port the Kubernetes API server listens on.
    pub port: u16,
    /// Short version, e.g. `1.23.6`; resolved through the catalog.
    pub kubernetes_version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Starting,
    Started,
    Stopping,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    StateChanged(LifecycleState),
    /// Progress changed; consumers re-read the snapshot.
    Progress,
    CurrentPortChanged(u16),
    VersionsUpdated,
}

/// Receives controller events synchronously, on whichever thread produced
/// them.
pub trait EventSink: Send + Sync {
    fn event(&self, event: &Event);
}

/// Sink for callers that do not care about events.
pub struct NullSink;

impl EventSink for NullSink {
    fn event(&self, _event: &Event) {}
}

/// One differing field of [`RestartReasons`]: `[actual, desired]` when the
/// values differ, both `None` when they match.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDiff<T> {
    pub actual: Option<T>,
    pub desired: Option<T>,
}

impl<T> Default for FieldDiff<T> {
    fn default() -> Self {
        Self {
            actual: None,
            desired: None,
        }
    }
}

impl<T: PartialEq> FieldDiff<T> {
    fn compare(actual: T, desired: T) -> Self {
        if actual == desired {
            Self::default()
        } else {
            Self {
                actual: Some(actual),
                desired: Some(desired),
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.actual.is_none() && self.desired.is_none()
    }
}

/// Settings changes that only take effect after a guest restart, diffed
/// against what the guest is actually running with.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestartReasons {
    pub cpu: FieldDiff<u32>,
    /// Memory in GiB, matching the unit users configure.
    pub memory: FieldDiff<f64>,
    pub port: FieldDiff<u16>,
}

impl RestartReasons {
    pub fn is_empty(&self) -> bool {
        self.cpu.is_empty() && self.memory.is_empty() && self.port.is_empty()
    }
}

// Action guard values. Distinct from LifecycleState: the state says what the
// guest is doing, the action says whose operation is in flight.
const ACTION_NONE: u8 = 0;
const ACTION_STARTING: u8 = 1;
const ACTION_STOPPING: u8 = 2;

pub struct LifecycleController<D, S> {
    driver: D,
    catalog: Mutex<VersionCatalog>,
    fetcher: ArtifactFetcher,
    kubeconfig: KubeconfigReconciler<S>,
    engine_context: EngineContextReconciler,
    probe: ReadinessProbe,
    sink: Box<dyn EventSink>,
    /// Directories removed wholesale by a factory reset.
    state_dirs: Vec<PathBuf>,

    state: Mutex<LifecycleState>,
    action: AtomicU8,
    progress: Mutex<Progress>,
    active_version: Mutex<Option<Version>>,
    current_port: Mutex<Option<u16>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<D, S> LifecycleController<D, S>
where
    D: GuestDriver + 'static,
    S: ContextSelector + Send + Sync + 'static,
{
    pub fn new(
        driver: D,
        catalog: VersionCatalog,
        fetcher: ArtifactFetcher,
        kubeconfig: KubeconfigReconciler<S>,
        engine_context: EngineContextReconciler,
        sink: Box<dyn EventSink>,
    ) -> Self {
        Self {
            driver,
            catalog: Mutex::new(catalog),
            fetcher,
            kubeconfig,
            engine_context,
            probe: ReadinessProbe::new(),
            sink,
            state_dirs: Vec::new(),
            state: Mutex::new(LifecycleState::Stopped),
            action: AtomicU8::new(ACTION_NONE),
            progress: Mutex::new(Progress::empty()),
            active_version: Mutex::new(None),
            current_port: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_state_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.state_dirs = dirs;
        self
    }

    #[must_use]
    pub fn with_probe(mut self, probe: ReadinessProbe) -> Self {
        self.probe = probe;
        self
    }

    pub fn state(&self) -> LifecycleState {
        *lock(&self.state)
    }

    pub fn progress(&self) -> Progress {
        lock(&self.progress).clone()
    }

    pub fn current_port(&self) -> Option<u16> {
        *lock(&self.current_port)
    }

    pub fn active_version(&self) -> Option<Version> {
        lock(&self.active_version).clone()
    }

    pub fn available_versions(&self) -> Vec<String> {
        lock(&self.catalog).available_versions()
    }

    /// CPU count the guest is actually running with.
    pub fn cpus(&self) -> Result<Option<u32>, CoreError> {
        Ok(self.driver.read_runtime_config()?.map(|c| c.cpus))
    }

    /// Memory the guest is actually running with, in bytes.
    pub fn memory(&self) -> Result<Option<u64>, CoreError> {
        Ok(self.driver.read_runtime_config()?.map(|c| c.memory_bytes))
    }

    /// Refresh the release catalog from the network.
    pub fn refresh_versions(&self) -> Result<(), CoreError> {
        lock(&self.catalog).refresh()?;
        self.emit(&Event::VersionsUpdated);
        Ok(())
    }

    /// Bring the guest up and make its cluster reachable.
    pub fn start(self: &Arc<Self>, config: &GuestConfiguration) -> Result<(), CoreError> {
        self.begin(ACTION_STARTING, "start")?;
        let result = self.run_start(config);
        self.end_action();
        if result.is_err() {
            self.set_state(LifecycleState::Error);
            self.set_progress(Progress::empty());
        }
        result
    }

    /// Stop the control plane and the guest.
    ///
    /// A no-op while another operation is in flight: the control plane exit
    /// handler calls this and must not race a stop already under way.
    pub fn stop(&self) -> Result<(), CoreError> {
        if self.begin(ACTION_STOPPING, "stop").is_err() {
            debug!("stop requested while another operation is in flight, ignoring");
            return Ok(());
        }
        let result = self.run_stop();
        self.end_action();
        if result.is_err() {
            self.set_state(LifecycleState::Error);
            self.set_progress(Progress::empty());
        }
        result
    }

    /// Stop (if needed) and destroy the guest.
    pub fn del(&self) -> Result<(), CoreError> {
        let result = self.run_del();
        if result.is_err() {
            self.set_state(LifecycleState::Error);
        }
        result
    }

    /// Full rebuild: destroy and start from scratch. Cheaper than an
    /// incremental reset for a single-node distribution.
    pub fn reset(self: &Arc<Self>, config: &GuestConfiguration) -> Result<(), CoreError> {
        self.del()?;
        self.start(config)
    }

    /// Destroy the guest and remove every cache and state directory this
    /// component owns.
    pub fn factory_reset(&self) -> Result<(), CoreError> {
        self.del()?;
        if let Err(err) = self.engine_context.clear_context() {
            debug!(%err, "could not clear container engine context");
        }
        for dir in &self.state_dirs {
            match std::fs::remove_dir_all(dir) {
                Ok(()) => info!(path = %dir.display(), "removed state directory"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Diff the guest's actual runtime configuration against `desired`.
    ///
    /// Returns an empty result when no guest descriptor can be read; with
    /// no guest there is nothing a restart would change.
    pub fn requires_restart_reasons(
        &self,
        desired: &GuestConfiguration,
    ) -> Result<RestartReasons, CoreError> {
        let Some(actual) = self.driver.read_runtime_config()? else {
            return Ok(RestartReasons::default());
        };
        let mut reasons = RestartReasons {
            cpu: FieldDiff::compare(actual.cpus, desired.cpus),
            memory: FieldDiff::compare(
                actual.memory_bytes as f64 / GIB,
                desired.memory_bytes as f64 / GIB,
            ),
            ..RestartReasons::default()
        };
        if let Some(port) = self.current_port() {
            reasons.port = FieldDiff::compare(port, desired.port);
        }
        Ok(reasons)
    }

    fn run_start(self: &Arc<Self>, config: &GuestConfiguration) -> Result<(), CoreError> {
        let full = self.resolve_full_version(&config.kubernetes_version)?;
        info!(version = %full, driver = self.driver.name(), "starting guest");
        self.set_state(LifecycleState::Starting);
        self.set_progress(Progress::indeterminate());

        let spec = GuestSpec {
            cpus: config.cpus,
            memory_bytes: config.memory_bytes,
            port: config.port,
            version: full.clone(),
        };

        // Artifact download and guest configuration generation do not
        // interfere; everything after the join is strictly sequential.
        let artifacts = {
            let timer = ProgressTimer::new(self.fetcher.progress(), {
                let controller = Arc::clone(self);
                move |progress| controller.set_progress(progress)
            });
            let result = thread::scope(|scope| {
                let fetch = scope.spawn(|| self.fetcher.ensure_artifacts(&full));
                let prepared = self.driver.prepare(&spec);
                let artifacts = fetch.join().map_err(|_| {
                    CoreError::Io(std::io::Error::other("artifact fetch thread panicked"))
                })?;
                prepared?;
                Ok::<_, CoreError>(artifacts?)
            });
            drop(timer);
            result?
        };

        self.set_progress(Progress::indeterminate().describe("starting virtual machine"));
        self.driver.halt_control_plane()?;
        self.driver.boot(&spec)?;

        self.set_progress(Progress::indeterminate().describe("installing k3s"));
        self.driver.install_release(&artifacts.directory, &full)?;

        let desired_version = parse_full_version(&full)?;
        if let Some(previous) = self.driver.persisted_version()? {
            if previous > desired_version {
                warn!(
                    %previous,
                    desired = %desired_version,
                    "downgrading kubernetes, deleting existing cluster state"
                );
                self.driver.clear_cluster_state()?;
            }
        }
        self.driver.record_version(&desired_version)?;

        self.set_progress(Progress::indeterminate().describe("starting kubernetes"));
        let handle = self.driver.launch_control_plane(config.port)?;
        self.spawn_exit_handler(handle);

        self.set_progress(Progress::indeterminate().describe("waiting for kubernetes api"));
        let ready = self.probe.wait_for_ready(
            || self.driver.read_address().ok().flatten(),
            config.port,
            || self.state() == LifecycleState::Error,
        )?;
        let Some(address) = ready else {
            return Err(CoreError::Cancelled);
        };

        self.set_progress(Progress::indeterminate().describe("updating kubeconfig"));
        let admin_kubeconfig = self.driver.read_admin_kubeconfig()?;
        self.kubeconfig.reconcile(&admin_kubeconfig)?;

        if let Some(socket) = self.driver.engine_socket() {
            let kubernetes_host = format!("https://{address}:{}", config.port);
            self.engine_context
                .update_context(&socket, Some(&kubernetes_host), false)?;
        }

        self.set_state(LifecycleState::Started);
        self.set_progress(Progress::done());

        *lock(&self.active_version) = Some(desired_version);
        let changed = {
            let mut port = lock(&self.current_port);
            if *port == Some(config.port) {
                false
            } else {
                *port = Some(config.port);
                true
            }
        };
        if changed {
            self.emit(&Event::CurrentPortChanged(config.port));
        }
        Ok(())
    }

    fn run_stop(&self) -> Result<(), CoreError> {
        self.set_state(LifecycleState::Stopping);
        self.driver.halt_control_plane()?;
        // Skip the guest-stop command when the guest is already down, so a
        // stop after a crash stays idempotent.
        if self.driver.state()? == GuestState::Running {
            self.driver.stop_guest()?;
        }
        self.set_state(LifecycleState::Stopped);
        self.set_progress(Progress::done());
        Ok(())
    }

    fn run_del(&self) -> Result<(), CoreError> {
        if self.state() != LifecycleState::Stopped {
            self.stop()?;
        }
        self.driver.destroy()?;
        *lock(&self.active_version) = None;
        self.set_progress(Progress::done());
        Ok(())
    }

    /// Resolve a short version through the catalog, refreshing it once when
    /// the version is not yet known locally.
    fn resolve_full_version(&self, short_version: &str) -> Result<String, CoreError> {
        let mut catalog = lock(&self.catalog);
        match catalog.full_version(short_version) {
            Ok(full) => Ok(full),
            Err(CatalogError::NoFullVersion(_)) => {
                catalog.refresh()?;
                self.emit(&Event::VersionsUpdated);
                Ok(catalog.full_version(short_version)?)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Watches the control plane until it exits. A clean exit (zero or
    /// SIGTERM) just stops the guest; anything else is a crash.
    fn spawn_exit_handler(self: &Arc<Self>, mut handle: Box<dyn ControlPlaneHandle>) {
        let controller = Arc::clone(self);
        thread::spawn(move || {
            let info = handle.wait().unwrap_or_else(|err| {
                warn!(%err, "could not wait for the control plane");
                ExitStatusInfo {
                    code: None,
                    signal: None,
                }
            });
            if info.is_clean() {
                debug!(?info, "control plane exited cleanly");
            } else {
                warn!(?info, "control plane exited abnormally");
                controller.set_state(LifecycleState::Error);
                controller.set_progress(Progress::empty());
            }
            if let Err(err) = controller.stop() {
                warn!(%err, "stop after control plane exit failed");
            }
        });
    }

    fn begin(&self, action: u8, name: &'static str) -> Result<(), CoreError> {
        self.action
            .compare_exchange(ACTION_NONE, action, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| CoreError::Busy(name))
    }

    fn end_action(&self) {
        self.action.store(ACTION_NONE, Ordering::Release);
    }

    fn set_state(&self, state: LifecycleState) {
        *lock(&self.state) = state;
        self.emit(&Event::StateChanged(state));
    }

    fn set_progress(&self, progress: Progress) {
        *lock(&self.progress) = progress;
        self.emit(&Event::Progress);
    }

    fn emit(&self, event: &Event) {
        self.sink.event(event);
    }
}

fn parse_full_version(full: &str) -> Result<Version, CoreError> {
    Version::parse(full.trim_start_matches('v'))
        .map_err(|err| CoreError::Catalog(CatalogError::InvalidVersion(err.to_string())))
}
