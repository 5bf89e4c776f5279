use crate::release::{parse_tag, ReleaseApiEntry};
use crate::{CatalogError, Release};
use semver::Version;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Release-listing API page size; the API caps pages at 100 entries.
const RELEASE_API_URL: &str = "https://api.github.com/repos/k3s-io/k3s/releases?per_page=100";
const RELEASE_API_ACCEPT: &str = "application/vnd.github.v3+json";
const CACHE_FILE: &str = "k3s-versions.json";

/// Catalog of known k3s releases.
///
/// Indexed by semantic version with build metadata stripped; only the newest
/// build of each version is retained. Releases below the minimum supported
/// floor, prereleases, and releases missing any required asset are rejected.
pub struct VersionCatalog {
    api_url: String,
    cache_path: PathBuf,
    minimum_version: Version,
    required_assets: Vec<String>,
    rate_limit_delay: Duration,
    agent: ureq::Agent,
    versions: BTreeMap<Version, Release>,
}

/// The asset names every usable release must carry.
pub const REQUIRED_ASSETS: [&str; 3] = ["k3s", "k3s-airgap-images-amd64.tar", "sha256sum-amd64.txt"];

impl VersionCatalog {
    /// Create a catalog backed by a cache file under `cache_dir`, pre-loaded
    /// with whatever was last persisted (or empty when nothing was).
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .build()
            .into();
        let mut catalog = Self {
            api_url: RELEASE_API_URL.to_owned(),
            cache_path: cache_dir.into().join(CACHE_FILE),
            minimum_version: Version::new(1, 15, 0),
            required_assets: REQUIRED_ASSETS.iter().map(|&s| s.to_owned()).collect(),
            rate_limit_delay: Duration::from_secs(1),
            agent,
            versions: BTreeMap::new(),
        };
        if let Err(e) = catalog.read_cache() {
            warn!("could not read version cache: {e}");
        }
        catalog
    }

    /// Point the catalog at a different release-listing API (test hook).
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    /// Shorten the rate-limit retry delay (test hook).
    pub fn with_rate_limit_delay(mut self, delay: Duration) -> Self {
        self.rate_limit_delay = delay;
        self
    }

    fn read_cache(&mut self) -> Result<(), CatalogError> {
        let raw = match std::fs::read_to_string(&self.cache_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let entries: Vec<String> = serde_json::from_str(&raw)?;
        for tag in entries {
            if let Some(release) = parse_tag(&tag) {
                self.versions.insert(release.short_version(), release);
            }
        }
        Ok(())
    }

    fn write_cache(&self) -> Result<(), CatalogError> {
        let tags: Vec<String> = self.versions.values().map(|r| r.version.to_string()).collect();
        if let Some(parent) = self.cache_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.cache_path, serde_json::to_vec(&tags)?)?;
        Ok(())
    }

    /// Process one listing entry, inserting it into the index when it is a
    /// new best build. Returns whether more entries should be fetched; we err
    /// on the side of fetching more when unsure.
    pub fn process_entry(&mut self, entry: &ReleaseApiEntry) -> bool {
        let Some(release) = parse_tag(&entry.tag_name) else {
            debug!("skipping unparsable version {}", entry.tag_name);
            return true;
        };
        if !release.version.pre.is_empty() {
            debug!("skipping pre-release {}", release.version);
            return true;
        }
        if release.short_version() < self.minimum_version {
            // Old releases may still grow new patch versions; keep fetching.
            debug!(
                "version {} is below the minimum {}, skipping",
                release.version, self.minimum_version
            );
            return true;
        }

        if let Some(known) = self.versions.get(&release.short_version()) {
            if release.build < known.build {
                // Listing is newest-first, so a lower build of a newer
                // version can show up before the last build of an older
                // version; keep fetching.
                debug!("skipping old build {}, have {}", release.version, known.version);
                return true;
            }
            if release.build == known.build {
                // The exact same version+build is the only safe signal that
                // everything further back has been seen already.
                debug!("found known version {}, stopping", release.version);
                return false;
            }
        }

        let complete = self
            .required_assets
            .iter()
            .all(|name| entry.assets.iter().any(|asset| &asset.name == name));
        if complete {
            info!("adding version {}", release.version);
            self.versions.insert(release.short_version(), release);
        } else {
            debug!("version {} is missing assets, skipping", release.version);
        }
        true
    }

    /// Refresh the catalog from the remote release listing, then persist it.
    ///
    /// Pages are fetched newest-first until a terminating duplicate is found
    /// or pages run out. A rate-limited response is retried after a short
    /// fixed delay, indefinitely; any other fetch failure is fatal.
    pub fn refresh(&mut self) -> Result<(), CatalogError> {
        info!("refreshing release catalog");
        let mut url = self.api_url.clone();
        loop {
            let response = self
                .agent
                .get(&url)
                .header("Accept", RELEASE_API_ACCEPT)
                .call()
                .map_err(|e| CatalogError::Fetch(e.to_string()))?;

            let status = response.status().as_u16();
            debug!("fetched {url} -> {status}");
            if status == 403 && header(&response, "X-RateLimit-Remaining") == Some("0".to_owned()) {
                std::thread::sleep(self.rate_limit_delay);
                continue;
            }
            if status >= 400 {
                return Err(CatalogError::Fetch(format!("HTTP {status} for {url}")));
            }

            let next_url = header(&response, "Link").and_then(|link| next_link(&link));
            let entries: Vec<ReleaseApiEntry> =
                serde_json::from_reader(response.into_body().into_reader())
                    .map_err(|e| CatalogError::Listing(e.to_string()))?;

            let mut want_more = true;
            for entry in &entries {
                if !self.process_entry(entry) {
                    want_more = false;
                    break;
                }
            }

            match next_url {
                Some(next) if want_more => url = next,
                _ => break,
            }
        }
        info!("catalog holds {} versions", self.versions.len());
        self.write_cache()?;
        Ok(())
    }

    /// Resolve a user-facing short version to the stored build-qualified tag.
    pub fn full_version(&self, short_version: &str) -> Result<String, CatalogError> {
        let parsed = Version::parse(short_version.trim_start_matches('v'))
            .map_err(|_| CatalogError::InvalidVersion(short_version.to_owned()))?;
        let key = Version::new(parsed.major, parsed.minor, parsed.patch);
        self.versions
            .get(&key)
            .map(Release::full_version)
            .ok_or_else(|| CatalogError::NoFullVersion(short_version.to_owned()))
    }

    /// All known short versions, strictly sorted descending.
    pub fn available_versions(&self) -> Vec<String> {
        self.versions.keys().rev().map(ToString::to_string).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    #[cfg(test)]
    fn insert_raw(&mut self, tag: &str) {
        let release = parse_tag(tag).unwrap();
        self.versions.insert(release.short_version(), release);
    }
}

fn header(response: &ureq::http::Response<ureq::Body>, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(ToOwned::to_owned)
}

/// Extract the `rel="next"` target from a `Link` response header.
fn next_link(link: &str) -> Option<String> {
    for part in link.split(',') {
        let part = part.trim();
        if !part.contains("rel=\"next\"") {
            continue;
        }
        let start = part.find('<')? + 1;
        let end = part.find('>')?;
        return Some(part[start..end].to_owned());
    }
    None
}
