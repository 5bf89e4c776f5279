//! Release-artifact cache for kapstan.
//!
//! Downloads the three artifacts a k3s release requires (executable, offline
//! image bundle, checksum manifest) into a per-version cache directory. A
//! directory is only ever accepted after every file's checksum matches the
//! manifest; fresh downloads are assembled in a sibling temporary directory
//! and renamed into place atomically.

pub mod checksum;
pub mod fetcher;

pub use checksum::{file_digest, parse_manifest};
pub use fetcher::{ArtifactFetcher, ArtifactSet, DownloadProgress, FetchProgress};

use thiserror::Error;

/// The k3s server executable.
pub const ARTIFACT_EXECUTABLE: &str = "k3s";
/// The offline (airgap) container image bundle.
pub const ARTIFACT_IMAGE_BUNDLE: &str = "k3s-airgap-images-amd64.tar";
/// The sha256 checksum manifest covering the other two artifacts.
pub const ARTIFACT_CHECKSUM_MANIFEST: &str = "sha256sum-amd64.txt";

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("error downloading {filename}: {reason}")]
    Download { filename: String, reason: String },
    #[error("{filename} has invalid digest {actual}, expected {expected}")]
    Integrity {
        filename: String,
        expected: String,
        actual: String,
    },
    #[error("checksum manifest has no entry for {0}")]
    MissingChecksum(String),
    #[error("artifact cache is locked by another process")]
    CacheLocked,
}
