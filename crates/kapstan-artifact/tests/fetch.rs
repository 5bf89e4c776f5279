//! Artifact fetch against a local mock download server.

use kapstan_artifact::{
    file_digest, ArtifactError, ArtifactFetcher, ARTIFACT_CHECKSUM_MANIFEST, ARTIFACT_EXECUTABLE,
    ARTIFACT_IMAGE_BUNDLE,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tiny_http::{Response, Server};

const VERSION: &str = "v1.23.6+k3s1";

fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(data))
}

/// Serve a fixed artifact set for `VERSION`, counting download hits.
fn start_server(files: HashMap<String, Vec<u8>>) -> (String, Arc<AtomicUsize>) {
    let server = Server::http("127.0.0.1:0").unwrap();
    let base = format!("http://{}", server.server_addr());
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_server = Arc::clone(&hits);
    std::thread::spawn(move || {
        for request in server.incoming_requests() {
            hits_server.fetch_add(1, Ordering::SeqCst);
            let filename = request.url().rsplit('/').next().unwrap_or("").to_owned();
            match files.get(&filename) {
                Some(data) => request.respond(Response::from_data(data.clone())).unwrap(),
                None => request
                    .respond(Response::from_string("missing").with_status_code(404))
                    .unwrap(),
            }
        }
    });
    (base, hits)
}

fn artifact_files() -> HashMap<String, Vec<u8>> {
    let exe = b"#!/bin/sh\necho k3s\n".to_vec();
    let images = b"tarball-of-images".to_vec();
    let manifest = format!(
        "{}  {ARTIFACT_EXECUTABLE}\n{}  {ARTIFACT_IMAGE_BUNDLE}\n",
        sha256_hex(&exe),
        sha256_hex(&images)
    );
    HashMap::from([
        (ARTIFACT_EXECUTABLE.to_owned(), exe),
        (ARTIFACT_IMAGE_BUNDLE.to_owned(), images),
        (ARTIFACT_CHECKSUM_MANIFEST.to_owned(), manifest.into_bytes()),
    ])
}

#[test]
fn downloads_and_installs_verified_set() {
    let (base, _hits) = start_server(artifact_files());
    let cache = tempfile::tempdir().unwrap();
    let fetcher = ArtifactFetcher::new(cache.path()).with_base_url(&base);

    let set = fetcher.ensure_artifacts(VERSION).unwrap();
    assert!(set.executable().is_file());
    assert!(set.image_bundle().is_file());
    assert!(set.checksum_manifest().is_file());
    assert_eq!(set.directory, cache.path().join("k3s").join(VERSION));

    // No tmp-* leftovers next to the installed set.
    let siblings: Vec<_> = std::fs::read_dir(cache.path().join("k3s"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("tmp-"))
        .collect();
    assert!(siblings.is_empty(), "leftover work dirs: {siblings:?}");
}

#[test]
fn second_ensure_performs_no_network_io() {
    let (base, hits) = start_server(artifact_files());
    let cache = tempfile::tempdir().unwrap();
    let fetcher = ArtifactFetcher::new(cache.path()).with_base_url(&base);

    fetcher.ensure_artifacts(VERSION).unwrap();
    let after_first = hits.load(Ordering::SeqCst);
    assert_eq!(after_first, 3);

    fetcher.ensure_artifacts(VERSION).unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), after_first);
}

#[test]
fn corrupted_download_is_rejected_and_not_installed() {
    let mut files = artifact_files();
    // Manifest advertises digests that do not match the served executable.
    files.insert(ARTIFACT_EXECUTABLE.to_owned(), b"tampered".to_vec());
    let (base, _hits) = start_server(files);

    let cache = tempfile::tempdir().unwrap();
    let fetcher = ArtifactFetcher::new(cache.path()).with_base_url(&base);

    let err = fetcher.ensure_artifacts(VERSION).unwrap_err();
    assert!(matches!(err, ArtifactError::Integrity { .. }));
    assert!(!cache.path().join("k3s").join(VERSION).exists());
}

#[test]
fn missing_artifact_is_a_download_error() {
    let mut files = artifact_files();
    files.remove(ARTIFACT_IMAGE_BUNDLE);
    let (base, _hits) = start_server(files);

    let cache = tempfile::tempdir().unwrap();
    let fetcher = ArtifactFetcher::new(cache.path()).with_base_url(&base);

    let err = fetcher.ensure_artifacts(VERSION).unwrap_err();
    assert!(matches!(err, ArtifactError::Download { .. }));
}

#[test]
fn progress_counters_reach_content_length() {
    let files = artifact_files();
    let exe_len = files[ARTIFACT_EXECUTABLE].len() as u64;
    let (base, _hits) = start_server(files);

    let cache = tempfile::tempdir().unwrap();
    let fetcher = ArtifactFetcher::new(cache.path()).with_base_url(&base);
    let progress = fetcher.progress();

    fetcher.ensure_artifacts(VERSION).unwrap();
    let (current, max) = progress.executable.snapshot();
    assert_eq!(current, exe_len);
    assert_eq!(max, exe_len);
    let (total_current, total_max) = progress.totals();
    assert_eq!(total_current, total_max);
    assert!(total_current > exe_len);
}

#[test]
fn invalid_cached_set_is_redownloaded() {
    let (base, hits) = start_server(artifact_files());
    let cache = tempfile::tempdir().unwrap();
    let fetcher = ArtifactFetcher::new(cache.path()).with_base_url(&base);

    let set = fetcher.ensure_artifacts(VERSION).unwrap();
    std::fs::write(set.executable(), b"bit rot").unwrap();

    let set = fetcher.ensure_artifacts(VERSION).unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 6);
    // Repaired: digest matches the manifest again.
    let manifest = std::fs::read_to_string(set.checksum_manifest()).unwrap();
    let expected = kapstan_artifact::parse_manifest(&manifest);
    assert_eq!(
        &file_digest(&set.executable()).unwrap(),
        expected.get(ARTIFACT_EXECUTABLE).unwrap()
    );
}
