//! Manages the container engine CLI's context directory.
//!
//! The engine CLI stores named contexts as metadata files under
//! `contexts/meta/<sha256(name)>/meta.json` and a pointer to the current
//! one in `config.json`. We maintain a context for the guest's engine
//! socket and move the pointer onto it only when the user's current
//! context is missing or points at a dead Unix socket, so a context the
//! user deliberately selected is never stolen while it works.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::{KubecfgError, WELL_KNOWN_CONTEXT};

/// The engine CLI's `config.json`, with every field we do not manage
/// preserved through `extra`.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
struct EngineConfig {
    #[serde(
        rename = "currentContext",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    current_context: Option<String>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ContextMeta {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Metadata", default)]
    metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(rename = "Endpoints")]
    endpoints: Endpoints,
}

#[derive(Debug, Serialize, Deserialize)]
struct Endpoints {
    #[serde(rename = "docker")]
    docker: EndpointSettings,
    #[serde(rename = "kubernetes", skip_serializing_if = "Option::is_none")]
    kubernetes: Option<EndpointSettings>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EndpointSettings {
    #[serde(rename = "Host")]
    host: String,
    #[serde(rename = "SkipTLSVerify")]
    skip_tls_verify: bool,
}

pub struct EngineContextReconciler {
    config_dir: PathBuf,
}

impl EngineContextReconciler {
    /// `config_dir` is the engine CLI's configuration directory, typically
    /// `~/.docker`.
    #[must_use]
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    /// Writes our context metadata and repoints `currentContext` if the
    /// user's choice no longer works. With `force_default` the pointer is
    /// cleared instead, leaving the engine's built-in default active.
    pub fn update_context(
        &self,
        engine_socket: &Path,
        kubernetes_host: Option<&str>,
        force_default: bool,
    ) -> Result<(), KubecfgError> {
        self.write_meta(engine_socket, kubernetes_host)?;

        let mut config = self.read_config()?;
        let desired = if force_default {
            None
        } else {
            self.resolve_current(config.current_context.as_deref())?
        };

        if config.current_context != desired {
            info!(
                from = config.current_context.as_deref().unwrap_or("<default>"),
                to = desired.as_deref().unwrap_or("<default>"),
                "switching container engine context"
            );
            config.current_context = desired;
            self.write_config(&config)?;
        }
        Ok(())
    }

    /// Removes our context and the pointer to it. Used by factory reset.
    pub fn clear_context(&self) -> Result<(), KubecfgError> {
        let dir = self.meta_dir().join(context_hash(WELL_KNOWN_CONTEXT));
        match fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let mut config = self.read_config()?;
        if config.current_context.as_deref() == Some(WELL_KNOWN_CONTEXT) {
            config.current_context = None;
            self.write_config(&config)?;
        }
        Ok(())
    }

    /// Decides which context the pointer should name. `None` means the
    /// engine default, which we only keep when forced; an unset pointer is
    /// otherwise claimed for ourselves.
    fn resolve_current(&self, current: Option<&str>) -> Result<Option<String>, KubecfgError> {
        let Some(current) = current else {
            return Ok(Some(WELL_KNOWN_CONTEXT.to_owned()));
        };
        if current == WELL_KNOWN_CONTEXT {
            return Ok(Some(WELL_KNOWN_CONTEXT.to_owned()));
        }
        match self.find_meta(current)? {
            Some(meta) => {
                let host = &meta.endpoints.docker.host;
                if let Some(socket) = host.strip_prefix("unix://") {
                    if socket_is_live(Path::new(socket)) {
                        Ok(Some(current.to_owned()))
                    } else {
                        debug!(context = current, socket, "current context socket is dead");
                        Ok(Some(WELL_KNOWN_CONTEXT.to_owned()))
                    }
                } else {
                    // Remote endpoints cannot be probed cheaply; trust them.
                    Ok(Some(current.to_owned()))
                }
            }
            None => {
                debug!(context = current, "current context has no metadata");
                Ok(Some(WELL_KNOWN_CONTEXT.to_owned()))
            }
        }
    }

    fn write_meta(
        &self,
        engine_socket: &Path,
        kubernetes_host: Option<&str>,
    ) -> Result<(), KubecfgError> {
        let meta = ContextMeta {
            name: WELL_KNOWN_CONTEXT.to_owned(),
            metadata: serde_json::Map::from_iter([(
                "Description".to_owned(),
                serde_json::Value::from("kapstan local Kubernetes"),
            )]),
            endpoints: Endpoints {
                docker: EndpointSettings {
                    host: format!("unix://{}", engine_socket.display()),
                    skip_tls_verify: false,
                },
                kubernetes: kubernetes_host.map(|host| EndpointSettings {
                    host: host.to_owned(),
                    skip_tls_verify: true,
                }),
            },
        };
        let dir = self.meta_dir().join(context_hash(WELL_KNOWN_CONTEXT));
        fs::create_dir_all(&dir)?;
        write_json(&dir.join("meta.json"), &meta)
    }

    /// Scans the metadata directory for a context with the given name.
    /// Entries that cannot be read or parsed are skipped; another tool may
    /// be writing them concurrently.
    fn find_meta(&self, name: &str) -> Result<Option<ContextMeta>, KubecfgError> {
        let meta_dir = self.meta_dir();
        let entries = match fs::read_dir(&meta_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let path = entry?.path().join("meta.json");
            let raw = match fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(err) => {
                    debug!(path = %path.display(), %err, "skipping unreadable context metadata");
                    continue;
                }
            };
            match serde_json::from_str::<ContextMeta>(&raw) {
                Ok(meta) if meta.name == name => return Ok(Some(meta)),
                Ok(_) => {}
                Err(err) => {
                    debug!(path = %path.display(), %err, "skipping unparsable context metadata");
                }
            }
        }
        Ok(None)
    }

    fn read_config(&self) -> Result<EngineConfig, KubecfgError> {
        match fs::read_to_string(self.config_path()) {
            Ok(raw) if raw.trim().is_empty() => Ok(EngineConfig::default()),
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(EngineConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    fn write_config(&self, config: &EngineConfig) -> Result<(), KubecfgError> {
        fs::create_dir_all(&self.config_dir)?;
        write_json(&self.config_path(), config)
    }

    fn config_path(&self) -> PathBuf {
        self.config_dir.join("config.json")
    }

    fn meta_dir(&self) -> PathBuf {
        self.config_dir.join("contexts").join("meta")
    }
}

/// The engine CLI names context directories by the SHA-256 of the context
/// name.
fn context_hash(name: &str) -> String {
    hex::encode(Sha256::digest(name.as_bytes()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), KubecfgError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(serde_json::to_string_pretty(value)?.as_bytes())?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

#[cfg(unix)]
fn socket_is_live(path: &Path) -> bool {
    std::os::unix::net::UnixStream::connect(path).is_ok()
}

#[cfg(not(unix))]
fn socket_is_live(_path: &Path) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;

    fn write_other_context(config_dir: &Path, name: &str, host: &str) {
        let dir = config_dir
            .join("contexts")
            .join("meta")
            .join(context_hash(name));
        fs::create_dir_all(&dir).unwrap();
        let meta = serde_json::json!({
            "Name": name,
            "Metadata": {},
            "Endpoints": { "docker": { "Host": host, "SkipTLSVerify": false } },
        });
        fs::write(dir.join("meta.json"), meta.to_string()).unwrap();
    }

    fn read_config(config_dir: &Path) -> serde_json::Value {
        serde_json::from_str(&fs::read_to_string(config_dir.join("config.json")).unwrap()).unwrap()
    }

    #[test]
    fn claims_pointer_when_no_context_is_set() {
        let dir = tempfile::tempdir().unwrap();
        let reconciler = EngineContextReconciler::new(dir.path());
        reconciler
            .update_context(Path::new("/run/guest.sock"), None, false)
            .unwrap();

        assert_eq!(read_config(dir.path())["currentContext"], "kapstan");
        let meta_path = dir
            .path()
            .join("contexts")
            .join("meta")
            .join(context_hash("kapstan"))
            .join("meta.json");
        let meta: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(meta_path).unwrap()).unwrap();
        assert_eq!(
            meta["Endpoints"]["docker"]["Host"],
            "unix:///run/guest.sock"
        );
    }

    #[test]
    fn meta_includes_kubernetes_endpoint_when_given() {
        let dir = tempfile::tempdir().unwrap();
        let reconciler = EngineContextReconciler::new(dir.path());
        reconciler
            .update_context(
                Path::new("/run/guest.sock"),
                Some("https://127.0.0.1:6443"),
                false,
            )
            .unwrap();

        let meta_path = dir
            .path()
            .join("contexts")
            .join("meta")
            .join(context_hash("kapstan"))
            .join("meta.json");
        let meta: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(meta_path).unwrap()).unwrap();
        assert_eq!(
            meta["Endpoints"]["kubernetes"]["Host"],
            "https://127.0.0.1:6443"
        );
    }

    #[test]
    fn live_user_context_is_left_alone_without_rewriting_config() {
        let dir = tempfile::tempdir().unwrap();
        let socket_dir = tempfile::tempdir().unwrap();
        let socket = socket_dir.path().join("live.sock");
        let _listener = UnixListener::bind(&socket).unwrap();

        write_other_context(
            dir.path(),
            "colima",
            &format!("unix://{}", socket.display()),
        );
        // Formatting serde would not reproduce, so a rewrite is detectable.
        let raw = "{\n    \"currentContext\":   \"colima\"\n}\n";
        fs::write(dir.path().join("config.json"), raw).unwrap();

        let reconciler = EngineContextReconciler::new(dir.path());
        reconciler
            .update_context(Path::new("/run/guest.sock"), None, false)
            .unwrap();

        assert_eq!(
            fs::read_to_string(dir.path().join("config.json")).unwrap(),
            raw
        );
    }

    #[test]
    fn dead_socket_context_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        write_other_context(dir.path(), "colima", "unix:///nonexistent/colima.sock");
        fs::write(
            dir.path().join("config.json"),
            r#"{"currentContext": "colima"}"#,
        )
        .unwrap();

        let reconciler = EngineContextReconciler::new(dir.path());
        reconciler
            .update_context(Path::new("/run/guest.sock"), None, false)
            .unwrap();
        assert_eq!(read_config(dir.path())["currentContext"], "kapstan");
    }

    #[test]
    fn context_without_metadata_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("config.json"),
            r#"{"currentContext": "gone"}"#,
        )
        .unwrap();

        let reconciler = EngineContextReconciler::new(dir.path());
        reconciler
            .update_context(Path::new("/run/guest.sock"), None, false)
            .unwrap();
        assert_eq!(read_config(dir.path())["currentContext"], "kapstan");
    }

    #[test]
    fn remote_endpoint_context_is_trusted() {
        let dir = tempfile::tempdir().unwrap();
        write_other_context(dir.path(), "remote", "ssh://user@host");
        fs::write(
            dir.path().join("config.json"),
            r#"{"currentContext": "remote"}"#,
        )
        .unwrap();

        let reconciler = EngineContextReconciler::new(dir.path());
        reconciler
            .update_context(Path::new("/run/guest.sock"), None, false)
            .unwrap();
        assert_eq!(read_config(dir.path())["currentContext"], "remote");
    }

    #[test]
    fn corrupted_sibling_metadata_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let junk = dir.path().join("contexts").join("meta").join("deadbeef");
        fs::create_dir_all(&junk).unwrap();
        fs::write(junk.join("meta.json"), "{ not json").unwrap();
        fs::write(
            dir.path().join("config.json"),
            r#"{"currentContext": "gone"}"#,
        )
        .unwrap();

        let reconciler = EngineContextReconciler::new(dir.path());
        reconciler
            .update_context(Path::new("/run/guest.sock"), None, false)
            .unwrap();
        assert_eq!(read_config(dir.path())["currentContext"], "kapstan");
    }

    #[test]
    fn force_default_clears_the_pointer() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("config.json"),
            r#"{"currentContext": "kapstan", "auths": {}}"#,
        )
        .unwrap();

        let reconciler = EngineContextReconciler::new(dir.path());
        reconciler
            .update_context(Path::new("/run/guest.sock"), None, true)
            .unwrap();

        let config = read_config(dir.path());
        assert!(config.get("currentContext").is_none());
        assert!(config.get("auths").is_some());
    }

    #[test]
    fn clear_context_removes_metadata_and_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let reconciler = EngineContextReconciler::new(dir.path());
        reconciler
            .update_context(Path::new("/run/guest.sock"), None, false)
            .unwrap();

        reconciler.clear_context().unwrap();
        assert!(!dir
            .path()
            .join("contexts")
            .join("meta")
            .join(context_hash("kapstan"))
            .exists());
        assert!(read_config(dir.path()).get("currentContext").is_none());
    }
}
