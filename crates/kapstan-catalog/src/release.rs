use semver::Version;
use serde::Deserialize;

/// One entry from the release-listing API.
#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseApiEntry {
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub browser_download_url: String,
}

/// A k3s release the catalog knows to exist.
///
/// `version` keeps the full build metadata (e.g. `1.23.6+k3s1`); the catalog
/// indexes releases by the version with build metadata stripped, since only
/// the newest build of each version is ever retained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub version: Version,
    pub build: i64,
}

impl Release {
    /// The version with build metadata stripped, used as the catalog index key.
    pub fn short_version(&self) -> Version {
        Version::new(self.version.major, self.version.minor, self.version.patch)
    }

    /// The build-qualified tag used in download URLs, e.g. `v1.23.6+k3s1`.
    pub fn full_version(&self) -> String {
        format!("v{}", self.version)
    }
}

/// Extract the k3s build number from a version's build-metadata tag.
///
/// `1.23.6+k3s1` yields 1; versions without a conforming `k3s<digits>` tag
/// yield -1 so that any conforming build outranks them.
pub fn build_number(version: &Version) -> i64 {
    let build = version.build.as_str();
    build
        .strip_prefix("k3s")
        .and_then(|digits| digits.parse().ok())
        .unwrap_or(-1)
}

/// Parse a release tag (`v1.23.6+k3s1`) into a [`Release`].
///
/// Returns `None` for tags that are not valid semantic versions.
pub fn parse_tag(tag: &str) -> Option<Release> {
    let version = Version::parse(tag.trim_start_matches('v')).ok()?;
    let build = build_number(&version);
    Some(Release { version, build })
}
