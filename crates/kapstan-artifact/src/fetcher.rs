use crate::checksum::verify_dir;
use crate::{
    ArtifactError, ARTIFACT_CHECKSUM_MANIFEST, ARTIFACT_EXECUTABLE, ARTIFACT_IMAGE_BUNDLE,
};
use fs2::FileExt;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

const DOWNLOAD_BASE_URL: &str = "https://github.com/k3s-io/k3s/releases/download";

/// Byte-level progress of one artifact download.
#[derive(Debug, Default)]
pub struct DownloadProgress {
    current: AtomicU64,
    max: AtomicU64,
}

impl DownloadProgress {
    pub fn snapshot(&self) -> (u64, u64) {
        (self.current.load(Ordering::Relaxed), self.max.load(Ordering::Relaxed))
    }

    /// Overwrite both counters.
    pub fn set(&self, current: u64, max: u64) {
        self.current.store(current, Ordering::Relaxed);
        self.max.store(max, Ordering::Relaxed);
    }

    fn reset(&self) {
        self.current.store(0, Ordering::Relaxed);
        self.max.store(0, Ordering::Relaxed);
    }
}

/// Independent progress counters for the three artifacts of a release, so a
/// caller can sum them for an aggregate percentage.
#[derive(Debug, Default)]
pub struct FetchProgress {
    pub executable: DownloadProgress,
    pub image_bundle: DownloadProgress,
    pub checksum: DownloadProgress,
}

impl FetchProgress {
    /// Sum of all counters as `(current, max)`.
    pub fn totals(&self) -> (u64, u64) {
        let parts = [
            self.executable.snapshot(),
            self.image_bundle.snapshot(),
            self.checksum.snapshot(),
        ];
        parts
            .iter()
            .fold((0, 0), |(c, m), (pc, pm)| (c + pc, m + pm))
    }

    fn reset(&self) {
        self.executable.reset();
        self.image_bundle.reset();
        self.checksum.reset();
    }
}

/// A verified per-version artifact directory.
#[derive(Debug, Clone)]
pub struct ArtifactSet {
    pub version: String,
    pub directory: PathBuf,
}

impl ArtifactSet {
    pub fn executable(&self) -> PathBuf {
        self.directory.join(ARTIFACT_EXECUTABLE)
    }

    pub fn image_bundle(&self) -> PathBuf {
        self.directory.join(ARTIFACT_IMAGE_BUNDLE)
    }

    pub fn checksum_manifest(&self) -> PathBuf {
        self.directory.join(ARTIFACT_CHECKSUM_MANIFEST)
    }
}

/// Downloads and verifies release artifact sets into a per-version cache.
pub struct ArtifactFetcher {
    cache_dir: PathBuf,
    base_url: String,
    agent: ureq::Agent,
    progress: Arc<FetchProgress>,
}

impl ArtifactFetcher {
    /// Create a fetcher caching artifacts under `<cache_dir>/k3s/<version>/`.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .build()
            .into();
        Self {
            cache_dir: cache_dir.into().join("k3s"),
            base_url: DOWNLOAD_BASE_URL.to_owned(),
            agent,
            progress: Arc::new(FetchProgress::default()),
        }
    }

    /// Point the fetcher at a different download base URL (test hook).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn progress(&self) -> Arc<FetchProgress> {
        Arc::clone(&self.progress)
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn set_for(&self, full_version: &str) -> ArtifactSet {
        ArtifactSet {
            version: full_version.to_owned(),
            directory: self.cache_dir.join(full_version),
        }
    }

    /// Ensure the artifacts for `full_version` are cached and verified.
    ///
    /// Idempotent: a directory whose checksums already match its manifest is
    /// accepted without network access. Otherwise all three artifacts are
    /// downloaded in parallel into a temporary sibling directory, re-verified,
    /// and only then renamed into the permanent per-version path. A checksum
    /// mismatch after download is a hard failure; no partial set is installed.
    pub fn ensure_artifacts(&self, full_version: &str) -> Result<ArtifactSet, ArtifactError> {
        let set = self.set_for(full_version);
        std::fs::create_dir_all(&self.cache_dir)?;

        if self.verify(&set.directory).is_ok() {
            debug!("artifact cache for {full_version} is valid");
            return Ok(set);
        }

        // Advisory lock so two kapstan processes never race the same
        // version's download; the loser re-checks the now-populated cache.
        let lock_file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.cache_dir.join(".lock"))?;
        lock_file
            .lock_exclusive()
            .map_err(|_| ArtifactError::CacheLocked)?;

        if self.verify(&set.directory).is_ok() {
            return Ok(set);
        }

        info!("downloading artifacts for {full_version}");
        self.progress.reset();
        let work = tempfile::Builder::new()
            .prefix(&format!("tmp-{full_version}-"))
            .tempdir_in(&self.cache_dir)?;

        self.download_all(work.path(), full_version)?;
        self.verify(work.path())?;

        if set.directory.exists() {
            std::fs::remove_dir_all(&set.directory)?;
        }
        safe_rename(work.path(), &set.directory)?;
        // `work` now points at a moved-away path; its drop is a no-op.
        Ok(set)
    }

    fn verify(&self, dir: &Path) -> Result<(), ArtifactError> {
        verify_dir(
            dir,
            ARTIFACT_CHECKSUM_MANIFEST,
            &[ARTIFACT_EXECUTABLE, ARTIFACT_IMAGE_BUNDLE],
        )
    }

    fn download_all(&self, dir: &Path, full_version: &str) -> Result<(), ArtifactError> {
        let jobs: [(&str, &DownloadProgress); 3] = [
            (ARTIFACT_EXECUTABLE, &self.progress.executable),
            (ARTIFACT_IMAGE_BUNDLE, &self.progress.image_bundle),
            (ARTIFACT_CHECKSUM_MANIFEST, &self.progress.checksum),
        ];
        std::thread::scope(|scope| {
            let handles: Vec<_> = jobs
                .into_iter()
                .map(|(filename, progress)| {
                    scope.spawn(move || self.download(dir, full_version, filename, progress))
                })
                .collect();
            for handle in handles {
                handle.join().map_err(|_| ArtifactError::Download {
                    filename: full_version.to_owned(),
                    reason: "download worker panicked".to_owned(),
                })??;
            }
            Ok(())
        })
    }

    fn download(
        &self,
        dir: &Path,
        full_version: &str,
        filename: &str,
        progress: &DownloadProgress,
    ) -> Result<(), ArtifactError> {
        // '+' in the build-qualified tag must be percent-encoded in the path.
        let url = format!(
            "{}/{}/{}",
            self.base_url,
            full_version.replace('+', "%2B"),
            filename
        );
        debug!("downloading {url}");
        let response = self
            .agent
            .get(&url)
            .call()
            .map_err(|e| ArtifactError::Download {
                filename: filename.to_owned(),
                reason: e.to_string(),
            })?;
        let status = response.status().as_u16();
        if status >= 400 {
            return Err(ArtifactError::Download {
                filename: filename.to_owned(),
                reason: format!("HTTP {status}"),
            });
        }

        let max = response
            .headers()
            .get("Content-Length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        progress.max.store(max, Ordering::Relaxed);

        let mut reader = response.into_body().into_reader();
        let mut file = std::fs::File::create(dir.join(filename))?;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf).map_err(|e| ArtifactError::Download {
                filename: filename.to_owned(),
                reason: e.to_string(),
            })?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])?;
            progress.current.fetch_add(n as u64, Ordering::Relaxed);
        }
        file.flush()?;
        Ok(())
    }
}

/// Rename `from` onto `to`, falling back to copy+delete when the rename
/// crosses storage devices.
pub fn safe_rename(from: &Path, to: &Path) -> Result<(), ArtifactError> {
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!("rename {} -> {} failed ({e}), copying instead", from.display(), to.display());
            copy_dir(from, to)?;
            std::fs::remove_dir_all(from)?;
            Ok(())
        }
    }
}

fn copy_dir(from: &Path, to: &Path) -> Result<(), std::io::Error> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_sum_all_counters() {
        let progress = FetchProgress::default();
        progress.executable.current.store(10, Ordering::Relaxed);
        progress.executable.max.store(100, Ordering::Relaxed);
        progress.image_bundle.current.store(5, Ordering::Relaxed);
        progress.image_bundle.max.store(50, Ordering::Relaxed);
        progress.checksum.current.store(1, Ordering::Relaxed);
        progress.checksum.max.store(1, Ordering::Relaxed);
        assert_eq!(progress.totals(), (16, 151));
    }

    #[test]
    fn safe_rename_moves_directory() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("from");
        std::fs::create_dir(&from).unwrap();
        std::fs::write(from.join("file"), b"data").unwrap();

        let to = dir.path().join("to");
        safe_rename(&from, &to).unwrap();
        assert!(!from.exists());
        assert_eq!(std::fs::read(to.join("file")).unwrap(), b"data");
    }

    #[test]
    fn artifact_set_paths() {
        let set = ArtifactSet {
            version: "v1.23.6+k3s1".to_owned(),
            directory: PathBuf::from("/cache/k3s/v1.23.6+k3s1"),
        };
        assert_eq!(set.executable(), Path::new("/cache/k3s/v1.23.6+k3s1/k3s"));
        assert_eq!(
            set.checksum_manifest(),
            Path::new("/cache/k3s/v1.23.6+k3s1/sha256sum-amd64.txt")
        );
    }
}
