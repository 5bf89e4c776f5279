//! Lifecycle orchestration for the local Kubernetes guest.
//!
//! This crate ties the lower layers together: the version catalog and
//! artifact fetcher supply a verified release, a [`GuestDriver`] boots and
//! manages the guest, and the controller in [`controller`] runs the state
//! machine that sequences the whole start/stop flow, emitting events and
//! progress snapshots for a frontend to render.
//!
//! [`GuestDriver`]: kapstan_guest::GuestDriver

pub mod concurrency;
pub mod controller;
pub mod probe;
pub mod progress;

pub use concurrency::{install_signal_handler, shutdown_requested, StateLock};
pub use controller::{
    Event, EventSink, FieldDiff, GuestConfiguration, LifecycleController, LifecycleState,
    NullSink, RestartReasons,
};
pub use probe::ReadinessProbe;
pub use progress::Progress;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Catalog(#[from] kapstan_catalog::CatalogError),

    #[error(transparent)]
    Artifact(#[from] kapstan_artifact::ArtifactError),

    #[error(transparent)]
    Guest(#[from] kapstan_guest::GuestError),

    #[error(transparent)]
    Kubecfg(#[from] kapstan_kubecfg::KubecfgError),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("another {0} operation is already in progress")]
    Busy(&'static str),

    #[error("start sequence was abandoned")]
    Cancelled,
}
