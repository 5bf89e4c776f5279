pub mod delete;
pub mod factory_reset;
pub mod reset;
pub mod restart_reasons;
pub mod start;
pub mod status;
pub mod stop;
pub mod versions;

use indicatif::{ProgressBar, ProgressStyle};
use kapstan_artifact::ArtifactFetcher;
use kapstan_catalog::VersionCatalog;
use kapstan_core::controller::{Event, EventSink, GuestConfiguration, LifecycleController};
use kapstan_core::LifecycleState;
use kapstan_guest::{GuestDriver, NativeDriver, VmDriver};
use kapstan_kubecfg::kubeconfig::ShellContextSelector;
use kapstan_kubecfg::{EngineContextReconciler, KubeconfigReconciler};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_LOCKED: u8 = 2;

pub type Controller = Arc<LifecycleController<Box<dyn GuestDriver>, ShellContextSelector>>;

/// A desired configuration with the version still unresolved.
pub struct PartialConfig {
    pub cpus: u32,
    pub memory_bytes: u64,
    pub port: u16,
    pub kubernetes_version: Option<String>,
}

pub const GIB: f64 = (1u64 << 30) as f64;

pub fn gib_to_bytes(gib: f64) -> u64 {
    (gib * GIB) as u64
}

/// Forwards controller events into the log; the spinners carry the
/// user-facing story.
struct LogSink;

impl EventSink for LogSink {
    fn event(&self, event: &Event) {
        debug!(?event, "controller event");
    }
}

pub fn build_controller(
    vm: bool,
    vm_cli: &str,
    hypervisor: &str,
    state_dir: &Path,
    cache_dir: &Path,
) -> Result<Controller, String> {
    let driver: Box<dyn GuestDriver> = if vm {
        Box::new(VmDriver::new(vm_cli, state_dir))
    } else {
        Box::new(NativeDriver::new(hypervisor, state_dir))
    };
    let catalog = VersionCatalog::new(cache_dir);
    let fetcher = ArtifactFetcher::new(cache_dir);
    let kubeconfig = KubeconfigReconciler::from_env(ShellContextSelector::default());
    let engine_dir = std::env::var("HOME")
        .map(|home| PathBuf::from(home).join(".docker"))
        .map_err(|_| "HOME is not set".to_owned())?;

    Ok(Arc::new(
        LifecycleController::new(
            driver,
            catalog,
            fetcher,
            kubeconfig,
            EngineContextReconciler::new(engine_dir),
            Box::new(LogSink),
        )
        .with_state_dirs(vec![state_dir.to_owned(), cache_dir.to_owned()]),
    ))
}

/// Resolve the version to run: the requested one, or the newest the catalog
/// knows (refreshing once when the catalog is empty).
pub fn resolve_version(
    controller: &Controller,
    requested: Option<&str>,
) -> Result<String, String> {
    if let Some(version) = requested {
        return Ok(version.to_owned());
    }
    let mut known = controller.available_versions();
    if known.is_empty() {
        controller.refresh_versions().map_err(|e| e.to_string())?;
        known = controller.available_versions();
    }
    known
        .into_iter()
        .next()
        .ok_or_else(|| "no kubernetes versions available".to_owned())
}

pub fn desired_config(
    controller: &Controller,
    partial: &PartialConfig,
) -> Result<GuestConfiguration, String> {
    Ok(GuestConfiguration {
        cpus: partial.cpus,
        memory_bytes: partial.memory_bytes,
        port: partial.port,
        kubernetes_version: resolve_version(controller, partial.kubernetes_version.as_deref())?,
    })
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .expect("valid template")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✗ {msg}"));
}

pub fn colorize_state(state: LifecycleState) -> String {
    use console::Style;
    match state {
        LifecycleState::Started => Style::new().green().apply_to("started").to_string(),
        LifecycleState::Starting => Style::new().cyan().apply_to("starting").to_string(),
        LifecycleState::Stopping => Style::new().yellow().apply_to("stopping").to_string(),
        LifecycleState::Stopped => Style::new().dim().apply_to("stopped").to_string(),
        LifecycleState::Error => Style::new().red().bold().apply_to("error").to_string(),
    }
}

pub fn state_name(state: LifecycleState) -> &'static str {
    match state {
        LifecycleState::Started => "started",
        LifecycleState::Starting => "starting",
        LifecycleState::Stopping => "stopping",
        LifecycleState::Stopped => "stopped",
        LifecycleState::Error => "error",
    }
}
