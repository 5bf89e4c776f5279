use crate::ArtifactError;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

/// Parse a `sha256sum`-style manifest into filename -> lowercase hex digest.
///
/// Lines that do not look like `<hex>  <filename>` are ignored.
pub fn parse_manifest(text: &str) -> HashMap<String, String> {
    let mut sums = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        let Some((digest, rest)) = line.split_once(char::is_whitespace) else {
            continue;
        };
        if digest.is_empty() || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            continue;
        }
        let filename = rest.trim().trim_start_matches('*');
        if filename.is_empty() {
            continue;
        }
        sums.insert(filename.to_owned(), digest.to_ascii_lowercase());
    }
    sums
}

/// Streaming sha256 of a file, as lowercase hex.
pub fn file_digest(path: &Path) -> Result<String, std::io::Error> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Verify that every file in `filenames` matches the manifest found in `dir`.
///
/// A missing manifest or missing file surfaces as an I/O error; a digest
/// mismatch is an integrity error naming both digests.
pub fn verify_dir(
    dir: &Path,
    manifest_name: &str,
    filenames: &[&str],
) -> Result<(), ArtifactError> {
    let manifest_text = std::fs::read_to_string(dir.join(manifest_name))?;
    let sums = parse_manifest(&manifest_text);
    for filename in filenames {
        let expected = sums
            .get(*filename)
            .ok_or_else(|| ArtifactError::MissingChecksum((*filename).to_owned()))?;
        let actual = file_digest(&dir.join(filename))?;
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(ArtifactError::Integrity {
                filename: (*filename).to_owned(),
                expected: expected.clone(),
                actual,
            });
        }
    }
    Ok(())
}
