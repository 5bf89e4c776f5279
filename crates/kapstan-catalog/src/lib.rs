//! k3s release catalog for kapstan.
//!
//! Tracks which k3s releases exist, indexed by semantic version with only the
//! newest build of each version retained. The catalog is refreshed from the
//! paginated release-listing API and persisted to a flat cache file so that
//! already-known versions stay resolvable while offline.

pub mod catalog;
pub mod release;

pub use catalog::VersionCatalog;
pub use release::{build_number, Release, ReleaseApiEntry};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not fetch releases: {0}")]
    Fetch(String),
    #[error("malformed release listing: {0}")]
    Listing(String),
    #[error("no full version for {0}")]
    NoFullVersion(String),
    #[error("invalid version string: {0}")]
    InvalidVersion(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
