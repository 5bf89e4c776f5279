//! Merges the guest's admin kubeconfig into the user's kubeconfig.
//!
//! The guest hands out credentials under a generated context name. We rename
//! the cluster, user, and context to the well-known name and upsert those
//! three entries into whichever kubeconfig file already knows about us, or
//! into the default location otherwise. Everything else in the user's file,
//! including fields this tool has never heard of, is carried through
//! untouched.

use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::{KubecfgError, WELL_KNOWN_CONTEXT};

/// A kubeconfig document. Only the parts we reconcile are modelled; every
/// other top-level field survives a round trip through `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KubeConfig {
    #[serde(rename = "apiVersion", default = "default_api_version")]
    api_version: String,
    #[serde(default = "default_kind")]
    kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    clusters: Vec<NamedEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    users: Vec<NamedEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    contexts: Vec<NamedContext>,
    #[serde(
        rename = "current-context",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    current_context: Option<String>,
    #[serde(flatten)]
    extra: serde_yaml::Mapping,
}

fn default_api_version() -> String {
    "v1".to_owned()
}

fn default_kind() -> String {
    "Config".to_owned()
}

/// A cluster or user entry. The payload is opaque to us.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedEntry {
    name: String,
    #[serde(flatten)]
    rest: serde_yaml::Mapping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedContext {
    name: String,
    context: ContextBody,
    #[serde(flatten)]
    rest: serde_yaml::Mapping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextBody {
    cluster: String,
    user: String,
    #[serde(flatten)]
    rest: serde_yaml::Mapping,
}

/// Marks a context as current for the user's tooling.
///
/// Split out as a trait so tests can observe the call without a `kubectl`
/// binary on the path.
pub trait ContextSelector {
    fn use_context(&self, kubeconfig: &Path, name: &str) -> Result<(), KubecfgError>;
}

/// Runs `kubectl config use-context` so kubectl's own bookkeeping (for
/// example its context history) stays consistent.
pub struct ShellContextSelector {
    kubectl: String,
}

impl ShellContextSelector {
    #[must_use]
    pub fn new(kubectl: impl Into<String>) -> Self {
        Self {
            kubectl: kubectl.into(),
        }
    }
}

impl Default for ShellContextSelector {
    fn default() -> Self {
        Self::new("kubectl")
    }
}

impl ContextSelector for ShellContextSelector {
    fn use_context(&self, kubeconfig: &Path, name: &str) -> Result<(), KubecfgError> {
        let output = Command::new(&self.kubectl)
            .arg("config")
            .arg("use-context")
            .arg(name)
            .env("KUBECONFIG", kubeconfig)
            .output()?;
        if output.status.success() {
            Ok(())
        } else {
            Err(KubecfgError::Selector(
                String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            ))
        }
    }
}

pub struct KubeconfigReconciler<S> {
    kubeconfig_env: Option<String>,
    home: Option<PathBuf>,
    selector: S,
}

impl<S: ContextSelector> KubeconfigReconciler<S> {
    /// Builds a reconciler from the process environment.
    #[must_use]
    pub fn from_env(selector: S) -> Self {
        Self {
            kubeconfig_env: env::var("KUBECONFIG").ok().filter(|v| !v.is_empty()),
            home: env::var_os("HOME").map(PathBuf::from),
            selector,
        }
    }

    #[must_use]
    pub fn with_paths(kubeconfig_env: Option<String>, home: Option<PathBuf>, selector: S) -> Self {
        Self {
            kubeconfig_env,
            home,
            selector,
        }
    }

    /// Merges the guest's admin kubeconfig into the user's file and makes
    /// the well-known context current. Returns the path that was updated.
    pub fn reconcile(&self, admin_kubeconfig: &str) -> Result<PathBuf, KubecfgError> {
        let mut guest: KubeConfig = serde_yaml::from_str(admin_kubeconfig)?;
        rename_to_well_known(&mut guest);

        let target = self.target_path()?;
        let mut config = load_or_default(&target)?;

        for cluster in guest.clusters {
            upsert(&mut config.clusters, cluster, |e| &e.name);
        }
        for user in guest.users {
            upsert(&mut config.users, user, |e| &e.name);
        }
        for context in guest.contexts {
            upsert(&mut config.contexts, context, |e| &e.name);
        }
        config.current_context = Some(WELL_KNOWN_CONTEXT.to_owned());

        write_atomically(&target, &config)?;
        info!(path = %target.display(), "updated kubeconfig");

        self.selector.use_context(&target, WELL_KNOWN_CONTEXT)?;
        Ok(target)
    }

    /// Picks the kubeconfig file to update: the first `KUBECONFIG` entry
    /// that already contains our context, otherwise `~/.kube/config`.
    fn target_path(&self) -> Result<PathBuf, KubecfgError> {
        if let Some(list) = &self.kubeconfig_env {
            for path in env::split_paths(list) {
                match fs::read_to_string(&path) {
                    Ok(raw) => match serde_yaml::from_str::<KubeConfig>(&raw) {
                        Ok(config)
                            if config
                                .contexts
                                .iter()
                                .any(|c| c.name == WELL_KNOWN_CONTEXT) =>
                        {
                            return Ok(path);
                        }
                        Ok(_) => {}
                        Err(err) => {
                            warn!(path = %path.display(), %err, "skipping unparsable kubeconfig");
                        }
                    },
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                        debug!(path = %path.display(), "kubeconfig entry does not exist");
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }

        let home = self.home.as_ref().ok_or(KubecfgError::NoKubeconfigLocation)?;
        let dir = home.join(".kube");
        fs::create_dir_all(&dir)?;
        Ok(dir.join("config"))
    }
}

/// Renames the guest's generated cluster/user/context triple to the
/// well-known name. The guest config is expected to carry exactly one of
/// each; extras are renamed too so no generated names leak into the user's
/// file.
fn rename_to_well_known(config: &mut KubeConfig) {
    for cluster in &mut config.clusters {
        cluster.name = WELL_KNOWN_CONTEXT.to_owned();
    }
    for user in &mut config.users {
        user.name = WELL_KNOWN_CONTEXT.to_owned();
    }
    for context in &mut config.contexts {
        context.name = WELL_KNOWN_CONTEXT.to_owned();
        context.context.cluster = WELL_KNOWN_CONTEXT.to_owned();
        context.context.user = WELL_KNOWN_CONTEXT.to_owned();
    }
    config.current_context = Some(WELL_KNOWN_CONTEXT.to_owned());
}

fn load_or_default(path: &Path) -> Result<KubeConfig, KubecfgError> {
    match fs::read_to_string(path) {
        Ok(raw) if raw.trim().is_empty() => Ok(KubeConfig::default()),
        Ok(raw) => Ok(serde_yaml::from_str(&raw)?),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(KubeConfig::default()),
        Err(err) => Err(err.into()),
    }
}

fn upsert<T, F: Fn(&T) -> &String>(entries: &mut Vec<T>, entry: T, name: F) {
    if let Some(existing) = entries.iter_mut().find(|e| name(e) == name(&entry)) {
        *existing = entry;
    } else {
        entries.push(entry);
    }
}

/// Writes via a temporary file in the same directory so a crash never
/// leaves the user with a truncated kubeconfig.
fn write_atomically(path: &Path, config: &KubeConfig) -> Result<(), KubecfgError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(serde_yaml::to_string(config)?.as_bytes())?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    const GUEST_CONFIG: &str = r"
apiVersion: v1
kind: Config
clusters:
- name: default
  cluster:
    server: https://127.0.0.1:6443
    certificate-authority-data: Zm9v
users:
- name: default
  user:
    client-certificate-data: YmFy
contexts:
- name: default
  context:
    cluster: default
    user: default
current-context: default
";

    struct RecordingSelector {
        calls: RefCell<Vec<String>>,
    }

    impl RecordingSelector {
        fn new() -> Self {
            Self {
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl ContextSelector for RecordingSelector {
        fn use_context(&self, _kubeconfig: &Path, name: &str) -> Result<(), KubecfgError> {
            self.calls.borrow_mut().push(name.to_owned());
            Ok(())
        }
    }

    fn reconciler(home: &Path) -> KubeconfigReconciler<RecordingSelector> {
        KubeconfigReconciler::with_paths(None, Some(home.to_owned()), RecordingSelector::new())
    }

    #[test]
    fn creates_default_kubeconfig_with_renamed_triple() {
        let home = tempfile::tempdir().unwrap();
        let reconciler = reconciler(home.path());

        let path = reconciler.reconcile(GUEST_CONFIG).unwrap();
        assert_eq!(path, home.path().join(".kube").join("config"));

        let written: KubeConfig =
            serde_yaml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written.clusters[0].name, "kapstan");
        assert_eq!(written.users[0].name, "kapstan");
        assert_eq!(written.contexts[0].name, "kapstan");
        assert_eq!(written.contexts[0].context.cluster, "kapstan");
        assert_eq!(written.contexts[0].context.user, "kapstan");
        assert_eq!(written.current_context.as_deref(), Some("kapstan"));
        assert_eq!(reconciler.selector.calls.borrow().as_slice(), ["kapstan"]);
    }

    #[test]
    fn repeated_reconcile_does_not_duplicate_entries() {
        let home = tempfile::tempdir().unwrap();
        let reconciler = reconciler(home.path());

        reconciler.reconcile(GUEST_CONFIG).unwrap();
        let path = reconciler.reconcile(GUEST_CONFIG).unwrap();

        let written: KubeConfig =
            serde_yaml::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(written.clusters.len(), 1);
        assert_eq!(written.users.len(), 1);
        assert_eq!(written.contexts.len(), 1);
    }

    #[test]
    fn preserves_unrelated_entries_and_unknown_fields() {
        let home = tempfile::tempdir().unwrap();
        let dir = home.path().join(".kube");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("config"),
            r"
apiVersion: v1
kind: Config
preferences:
  colors: true
clusters:
- name: production
  cluster:
    server: https://prod.example.com
contexts:
- name: production
  context:
    cluster: production
    user: production
    namespace: web
users:
- name: production
  user:
    token: sekrit
current-context: production
",
        )
        .unwrap();

        let reconciler = reconciler(home.path());
        let path = reconciler.reconcile(GUEST_CONFIG).unwrap();
        let raw = std::fs::read_to_string(path).unwrap();
        let written: KubeConfig = serde_yaml::from_str(&raw).unwrap();

        assert_eq!(written.clusters.len(), 2);
        assert!(written.contexts.iter().any(|c| c.name == "production"));
        assert_eq!(
            written
                .contexts
                .iter()
                .find(|c| c.name == "production")
                .unwrap()
                .context
                .rest
                .get("namespace"),
            Some(&serde_yaml::Value::from("web"))
        );
        assert!(raw.contains("preferences"));
        assert!(raw.contains("sekrit"));
        assert_eq!(written.current_context.as_deref(), Some("kapstan"));
    }

    #[test]
    fn kubeconfig_env_picks_file_containing_our_context() {
        let home = tempfile::tempdir().unwrap();
        let other = home.path().join("other.yaml");
        let ours = home.path().join("ours.yaml");
        std::fs::write(&other, "apiVersion: v1\nkind: Config\n").unwrap();
        std::fs::write(
            &ours,
            r"
apiVersion: v1
kind: Config
contexts:
- name: kapstan
  context:
    cluster: kapstan
    user: kapstan
",
        )
        .unwrap();

        let list = env::join_paths([&other, &ours])
            .unwrap()
            .into_string()
            .unwrap();
        let reconciler = KubeconfigReconciler::with_paths(
            Some(list),
            Some(home.path().to_owned()),
            RecordingSelector::new(),
        );
        assert_eq!(reconciler.reconcile(GUEST_CONFIG).unwrap(), ours);
    }

    #[test]
    fn kubeconfig_env_without_our_context_falls_back_to_home_default() {
        let home = tempfile::tempdir().unwrap();
        let other = home.path().join("other.yaml");
        std::fs::write(&other, "apiVersion: v1\nkind: Config\n").unwrap();
        let reconciler = KubeconfigReconciler::with_paths(
            Some(other.to_string_lossy().into_owned()),
            Some(home.path().to_owned()),
            RecordingSelector::new(),
        );
        assert_eq!(
            reconciler.reconcile(GUEST_CONFIG).unwrap(),
            home.path().join(".kube").join("config")
        );
        // The listed file is left alone.
        let untouched: KubeConfig =
            serde_yaml::from_str(&std::fs::read_to_string(&other).unwrap()).unwrap();
        assert!(untouched.contexts.is_empty());
    }

    #[test]
    fn kubeconfig_env_without_our_context_and_no_home_is_an_error() {
        let home = tempfile::tempdir().unwrap();
        let other = home.path().join("other.yaml");
        std::fs::write(&other, "apiVersion: v1\nkind: Config\n").unwrap();
        let reconciler = KubeconfigReconciler::with_paths(
            Some(other.to_string_lossy().into_owned()),
            None,
            RecordingSelector::new(),
        );
        assert!(matches!(
            reconciler.reconcile(GUEST_CONFIG),
            Err(KubecfgError::NoKubeconfigLocation)
        ));
    }

    #[test]
    fn missing_home_and_env_is_an_error() {
        let reconciler: KubeconfigReconciler<RecordingSelector> =
            KubeconfigReconciler::with_paths(None, None, RecordingSelector::new());
        assert!(matches!(
            reconciler.reconcile(GUEST_CONFIG),
            Err(KubecfgError::NoKubeconfigLocation)
        ));
    }
}
