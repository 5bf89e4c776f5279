//! Host-side configuration reconcilers.
//!
//! Two files on the host point tools at the guest: the user's kubeconfig
//! (for `kubectl`) and the container engine's CLI configuration (for the
//! `docker` client). Both are owned by the user and may be edited by other
//! tools at any time, so the reconcilers here merge rather than overwrite,
//! and never touch entries they did not create.

pub mod engine_context;
pub mod kubeconfig;

pub use engine_context::EngineContextReconciler;
pub use kubeconfig::{ContextSelector, KubeconfigReconciler, ShellContextSelector};

use thiserror::Error;

/// The context name reserved for this tool in both kubeconfig and the
/// container engine configuration.
pub const WELL_KNOWN_CONTEXT: &str = "kapstan";

#[derive(Error, Debug)]
pub enum KubecfgError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("could not find a kubeconfig location")]
    NoKubeconfigLocation,

    #[error("failed to select context: {0}")]
    Selector(String),
}
