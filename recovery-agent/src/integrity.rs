//! Content digests and sidecar files.
//!
//! Digests are SHA-256 over the raw byte stream of an artifact, so file
//! permissions and timestamps never influence them. The sidecar is written in
//! `sha256sum` format next to the artifact: `<hex>  <file name>`.

use crate::utils::errors::{DrError, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// Sidecar suffix appended to the artifact file name
pub const SIDECAR_SUFFIX: &str = ".sha256";

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Compute the hex SHA-256 digest of a byte stream.
pub fn digest<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Check a byte stream against an expected hex digest (case-insensitive).
pub fn verify<R: Read>(reader: R, expected: &str) -> io::Result<bool> {
    let actual = digest(reader)?;
    Ok(actual.eq_ignore_ascii_case(expected.trim()))
}

/// Digest a file on disk.
pub fn digest_file(path: &Path) -> Result<String> {
    Ok(digest(File::open(path)?)?)
}

/// Verify a file against an expected digest, failing with an integrity error
/// on mismatch. Never writes anything.
pub fn verify_file(path: &Path, expected: &str) -> Result<()> {
    let actual = digest_file(path)?;
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(DrError::Integrity {
            artifact: path.display().to_string(),
            expected: expected.trim().to_string(),
            actual,
        })
    }
}

/// `digest_file` on the blocking pool
pub async fn digest_file_async(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || digest_file(&path))
        .await
        .map_err(|e| DrError::Archive(format!("digest task failed: {}", e)))?
}

/// `verify_file` on the blocking pool
pub async fn verify_file_async(path: &Path, expected: &str) -> Result<()> {
    let path = path.to_path_buf();
    let expected = expected.to_string();
    tokio::task::spawn_blocking(move || verify_file(&path, &expected))
        .await
        .map_err(|e| DrError::Archive(format!("verify task failed: {}", e)))?
}

/// Path of the sidecar belonging to an artifact.
pub fn sidecar_path(artifact: &Path) -> PathBuf {
    let mut name = artifact
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(SIDECAR_SUFFIX);
    artifact.with_file_name(name)
}

/// Persist the digest next to the artifact.
pub fn write_sidecar(artifact: &Path, digest: &str) -> Result<PathBuf> {
    let path = sidecar_path(artifact);
    let file_name = artifact
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    std::fs::write(&path, format!("{}  {}\n", digest, file_name))?;
    Ok(path)
}

/// Read the digest recorded in an artifact's sidecar.
pub fn read_sidecar(artifact: &Path) -> Result<String> {
    let path = sidecar_path(artifact);
    let content = std::fs::read_to_string(&path)?;
    parse_sidecar(&content)
        .ok_or_else(|| DrError::Archive(format!("malformed digest sidecar: {}", path.display())))
}

fn parse_sidecar(content: &str) -> Option<String> {
    let token = content.split_whitespace().next()?;
    let valid = token.len() == 64 && token.chars().all(|c| c.is_ascii_hexdigit());
    valid.then(|| token.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_digest_known_value() {
        let d = digest(&b"abc"[..]).unwrap();
        assert_eq!(
            d,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_digest_ignores_metadata() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new()?;
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::write(&a, b"same bytes")?;
        std::fs::write(&b, b"same bytes")?;
        std::fs::set_permissions(&b, std::fs::Permissions::from_mode(0o600))?;

        assert_eq!(digest_file(&a)?, digest_file(&b)?);
        Ok(())
    }

    #[test]
    fn test_verify_detects_single_byte_change() -> Result<()> {
        let dir = TempDir::new()?;
        let artifact = dir.path().join("node-full.dra");
        std::fs::write(&artifact, vec![7u8; 4096])?;
        let expected = digest_file(&artifact)?;

        let mut bytes = std::fs::read(&artifact)?;
        bytes[2048] ^= 0x01;
        std::fs::write(&artifact, &bytes)?;

        assert!(!verify(File::open(&artifact)?, &expected)?);
        assert!(matches!(
            verify_file(&artifact, &expected),
            Err(DrError::Integrity { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_sidecar_roundtrip() -> Result<()> {
        let dir = TempDir::new()?;
        let artifact = dir.path().join("node-full-20260101T000000000Z.dra.enc");
        std::fs::write(&artifact, b"payload")?;
        let d = digest_file(&artifact)?;

        let sidecar = write_sidecar(&artifact, &d)?;
        assert_eq!(
            sidecar.file_name().unwrap().to_string_lossy(),
            "node-full-20260101T000000000Z.dra.enc.sha256"
        );
        assert_eq!(read_sidecar(&artifact)?, d);
        Ok(())
    }

    #[test]
    fn test_malformed_sidecar_is_rejected() {
        assert_eq!(parse_sidecar("not-a-digest  file"), None);
        assert_eq!(parse_sidecar(""), None);
    }
}
