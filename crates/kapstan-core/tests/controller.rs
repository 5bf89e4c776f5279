//! End-to-end lifecycle tests against the in-memory mock driver.
//!
//! The catalog cache and the artifact cache are pre-populated so a start
//! needs no network access; the readiness probe talks to a local TLS
//! server whose certificate names 127.0.0.1.

use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use kapstan_core::controller::{
    Event, EventSink, GuestConfiguration, LifecycleController, LifecycleState,
};
use kapstan_core::{CoreError, Progress, ReadinessProbe};
use kapstan_artifact::ArtifactFetcher;
use kapstan_catalog::VersionCatalog;
use kapstan_guest::{GuestDriver, MockDriver};
use kapstan_kubecfg::kubeconfig::ContextSelector;
use kapstan_kubecfg::{EngineContextReconciler, KubecfgError, KubeconfigReconciler};
use semver::Version;
use sha2::{Digest, Sha256};

const GIB: u64 = 1 << 30;

const GUEST_KUBECONFIG: &str = r"
apiVersion: v1
kind: Config
clusters:
- name: default
  cluster:
    server: https://127.0.0.1:6443
users:
- name: default
  user:
    token: abc
contexts:
- name: default
  context:
    cluster: default
    user: default
current-context: default
";

struct NoopSelector;

impl ContextSelector for NoopSelector {
    fn use_context(&self, _kubeconfig: &Path, _name: &str) -> Result<(), KubecfgError> {
        Ok(())
    }
}

#[derive(Clone, Default)]
struct RecordingSink {
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventSink for RecordingSink {
    fn event(&self, event: &Event) {
        self.events.lock().unwrap().push(event.clone());
    }
}

impl RecordingSink {
    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

/// A TLS endpoint that answers handshakes until the test process exits.
fn serve_tls(san: &str) -> u16 {
    let key = rcgen::generate_simple_self_signed(vec![san.to_owned()]).unwrap();
    let cert = key.cert.der().clone();
    let key = rustls_pki_types::PrivateKeyDer::Pkcs8(rustls_pki_types::PrivatePkcs8KeyDer::from(
        key.key_pair.serialize_der(),
    ));
    let config = Arc::new(
        rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)
            .unwrap(),
    );
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut tcp) = stream else { break };
            let mut conn = rustls::ServerConnection::new(Arc::clone(&config)).unwrap();
            while conn.is_handshaking() {
                if conn.complete_io(&mut tcp).is_err() {
                    break;
                }
            }
        }
    });
    port
}

fn write_artifact_set(cache: &Path, full_version: &str) {
    let dir = cache.join("k3s").join(full_version);
    std::fs::create_dir_all(&dir).unwrap();
    let mut manifest = String::new();
    for (name, content) in [
        ("k3s", format!("binary for {full_version}")),
        ("k3s-airgap-images-amd64.tar", "images".to_owned()),
    ] {
        std::fs::write(dir.join(name), &content).unwrap();
        let digest = hex::encode(Sha256::digest(content.as_bytes()));
        manifest.push_str(&format!("{digest}  {name}\n"));
    }
    std::fs::write(dir.join("sha256sum-amd64.txt"), manifest).unwrap();
}

struct Fixture {
    _tmp: tempfile::TempDir,
    controller: Arc<LifecycleController<MockDriver, NoopSelector>>,
    driver: MockDriver,
    sink: RecordingSink,
    port: u16,
    home: PathBuf,
    cache: PathBuf,
    engine_dir: PathBuf,
}

fn fixture() -> Fixture {
    fixture_with_api_url(None)
}

fn fixture_with_api_url(api_url: Option<String>) -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let cache = tmp.path().join("cache");
    let state = tmp.path().join("state");
    let home = tmp.path().join("home");
    let engine_dir = tmp.path().join("engine");
    std::fs::create_dir_all(&cache).unwrap();

    std::fs::write(
        cache.join("k3s-versions.json"),
        r#"["1.23.6+k3s1","1.24.1+k3s2"]"#,
    )
    .unwrap();
    write_artifact_set(&cache, "v1.23.6+k3s1");
    write_artifact_set(&cache, "v1.24.1+k3s2");

    let port = serve_tls("127.0.0.1");

    let driver = MockDriver::new();
    driver.set_address(Some("127.0.0.1"));
    driver.set_kubeconfig(GUEST_KUBECONFIG);

    let mut catalog = VersionCatalog::new(&cache);
    if let Some(url) = api_url {
        catalog = catalog.with_api_url(url);
    }
    let sink = RecordingSink::default();
    let controller = Arc::new(
        LifecycleController::new(
            driver.clone(),
            catalog,
            ArtifactFetcher::new(&cache),
            KubeconfigReconciler::with_paths(None, Some(home.clone()), NoopSelector),
            EngineContextReconciler::new(&engine_dir),
            Box::new(sink.clone()),
        )
        .with_state_dirs(vec![cache.clone(), state])
        .with_probe(ReadinessProbe::new().with_delay(Duration::from_millis(20))),
    );

    Fixture {
        _tmp: tmp,
        controller,
        driver,
        sink,
        port,
        home,
        cache,
        engine_dir,
    }
}

fn config(f: &Fixture) -> GuestConfiguration {
    GuestConfiguration {
        cpus: 1,
        memory_bytes: 2 * GIB,
        port: f.port,
        kubernetes_version: "1.23.6".to_owned(),
    }
}

fn wait_for_state(f: &Fixture, state: LifecycleState) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while f.controller.state() != state {
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {state:?}, at {:?}",
            f.controller.state()
        );
        thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn start_brings_the_guest_to_started() {
    let f = fixture();
    f.driver
        .set_engine_socket(Some(f._tmp.path().join("engine.sock")));

    f.controller.start(&config(&f)).unwrap();

    assert_eq!(f.controller.state(), LifecycleState::Started);
    assert_eq!(f.controller.progress(), Progress::done());
    assert_eq!(f.controller.current_port(), Some(f.port));
    assert_eq!(
        f.controller.active_version(),
        Some(Version::parse("1.23.6+k3s1").unwrap())
    );

    assert_eq!(f.driver.boots().len(), 1);
    assert_eq!(f.driver.boots()[0].version, "v1.23.6+k3s1");
    assert!(!f.driver.prepares().is_empty());
    assert_eq!(f.driver.installs(), ["v1.23.6+k3s1"]);
    assert_eq!(f.driver.clear_state_calls(), 0);

    let kubeconfig =
        std::fs::read_to_string(f.home.join(".kube").join("config")).unwrap();
    assert!(kubeconfig.contains("kapstan"));

    let engine_config: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(f.engine_dir.join("config.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(engine_config["currentContext"], "kapstan");

    let events = f.sink.events();
    assert!(events.contains(&Event::StateChanged(LifecycleState::Starting)));
    assert!(events.contains(&Event::StateChanged(LifecycleState::Started)));
    assert!(events.contains(&Event::CurrentPortChanged(f.port)));
}

#[test]
fn port_change_event_fires_only_on_change() {
    let f = fixture();
    f.controller.start(&config(&f)).unwrap();
    f.controller.start(&config(&f)).unwrap();

    let changes = f
        .sink
        .events()
        .iter()
        .filter(|e| matches!(e, Event::CurrentPortChanged(_)))
        .count();
    assert_eq!(changes, 1);
}

#[test]
fn downgrade_clears_cluster_state() {
    let f = fixture();
    f.driver
        .set_persisted_version(Some(Version::parse("1.24.1+k3s2").unwrap()));

    f.controller.start(&config(&f)).unwrap();

    assert_eq!(f.driver.clear_state_calls(), 1);
    assert_eq!(
        f.driver.persisted_version().unwrap(),
        Some(Version::parse("1.23.6+k3s1").unwrap())
    );
}

#[test]
fn upgrade_keeps_cluster_state() {
    let f = fixture();
    f.driver
        .set_persisted_version(Some(Version::parse("1.22.1+k3s1").unwrap()));
    f.controller.start(&config(&f)).unwrap();
    assert_eq!(f.driver.clear_state_calls(), 0);
}

#[test]
fn stop_is_idempotent_and_exit_handler_does_not_double_stop() {
    let f = fixture();
    f.controller.start(&config(&f)).unwrap();

    f.controller.stop().unwrap();
    wait_for_state(&f, LifecycleState::Stopped);
    // Give the exit-handler thread time to run its own stop().
    thread::sleep(Duration::from_millis(200));
    assert_eq!(f.driver.stop_calls(), 1);

    // A second stop finds the guest already down and does nothing more.
    f.controller.stop().unwrap();
    assert_eq!(f.driver.stop_calls(), 1);
    assert_eq!(f.controller.state(), LifecycleState::Stopped);
}

#[test]
fn abnormal_control_plane_exit_reports_error_then_stops() {
    let f = fixture();
    f.controller.start(&config(&f)).unwrap();

    f.driver.trigger_exit(kapstan_guest::ExitStatusInfo {
        code: Some(1),
        signal: None,
    });
    wait_for_state(&f, LifecycleState::Stopped);

    let events = f.sink.events();
    assert!(events.contains(&Event::StateChanged(LifecycleState::Error)));
}

#[test]
fn restart_reasons_diff_actual_against_desired() {
    let f = fixture();
    f.controller.start(&config(&f)).unwrap();

    let desired = GuestConfiguration {
        cpus: 2,
        memory_bytes: 4 * GIB,
        port: f.port.wrapping_add(1),
        kubernetes_version: "1.23.6".to_owned(),
    };
    let reasons = f.controller.requires_restart_reasons(&desired).unwrap();

    assert_eq!(reasons.cpu.actual, Some(1));
    assert_eq!(reasons.cpu.desired, Some(2));
    assert_eq!(reasons.memory.actual, Some(2.0));
    assert_eq!(reasons.memory.desired, Some(4.0));
    assert_eq!(reasons.port.actual, Some(f.port));
    assert_eq!(reasons.port.desired, Some(f.port.wrapping_add(1)));

    let unchanged = f.controller.requires_restart_reasons(&config(&f)).unwrap();
    assert!(unchanged.is_empty());
}

#[test]
fn restart_reasons_without_a_guest_are_empty() {
    let f = fixture();
    let reasons = f.controller.requires_restart_reasons(&config(&f)).unwrap();
    assert!(reasons.is_empty());
}

#[test]
fn del_destroys_the_guest_and_clears_the_active_version() {
    let f = fixture();
    f.controller.start(&config(&f)).unwrap();

    f.controller.del().unwrap();
    // Let the exit-handler thread finish its no-op stop before asserting.
    thread::sleep(Duration::from_millis(100));

    assert_eq!(f.driver.destroy_calls(), 1);
    assert_eq!(f.controller.active_version(), None);
    assert_eq!(f.controller.state(), LifecycleState::Stopped);
}

#[test]
fn reset_rebuilds_from_scratch() {
    let f = fixture();
    f.controller.start(&config(&f)).unwrap();

    f.controller.reset(&config(&f)).unwrap();

    assert_eq!(f.driver.destroy_calls(), 1);
    assert_eq!(f.driver.boots().len(), 2);
    assert_eq!(f.controller.state(), LifecycleState::Started);
}

#[test]
fn factory_reset_removes_state_directories() {
    let f = fixture();
    f.controller.start(&config(&f)).unwrap();
    assert!(f.cache.exists());

    f.controller.factory_reset().unwrap();

    assert!(!f.cache.exists());
    assert_eq!(f.driver.destroy_calls(), 1);
}

#[test]
fn unknown_version_refreshes_once_then_fails() {
    let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
    let url = format!("http://{}/releases", server.server_addr());
    thread::spawn(move || {
        if let Ok(request) = server.recv() {
            let response = tiny_http::Response::from_string("[]").with_header(
                tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
                    .unwrap(),
            );
            let _ = request.respond(response);
        }
    });

    let f = fixture_with_api_url(Some(url));
    let mut wanted = config(&f);
    wanted.kubernetes_version = "9.9.9".to_owned();

    let err = f.controller.start(&wanted).unwrap_err();
    assert!(matches!(err, CoreError::Catalog(_)));
    assert_eq!(f.controller.state(), LifecycleState::Error);
}
