//! SHA256 verification for downloaded payloads.
//!
//! Only a [`VerifiedPayload`] can reach the installer, and one can only be
//! obtained from [`verify_payload`].

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::download::{DownloadedPayload, remove_if_exists};
use crate::error::{UpdateError, UpdateResult};
use crate::manifest::UpdateManifest;

/// A payload whose content matches its manifest checksum and size.
#[derive(Debug)]
pub struct VerifiedPayload {
    path: PathBuf,
    manifest: UpdateManifest,
    sha256: String,
}

impl VerifiedPayload {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn manifest(&self) -> &UpdateManifest {
        &self.manifest
    }

    /// Lowercase hex digest of the payload.
    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    /// Delete the payload file.
    pub async fn discard(self) -> UpdateResult<()> {
        remove_if_exists(&self.path).await
    }
}

/// Outcome of verifying a downloaded payload.
#[derive(Debug)]
pub enum Verification {
    Verified(VerifiedPayload),
    /// The content does not match; the payload is handed back for disposal
    Rejected {
        payload: DownloadedPayload,
        actual: String,
    },
}

/// Check a downloaded payload against its manifest.
///
/// A missing staging file is a mismatch, not an error: the bytes the cycle
/// counted on are gone and must be fetched again.
pub async fn verify_payload(payload: DownloadedPayload) -> UpdateResult<Verification> {
    let expected = payload.manifest().expected_checksum.trim().to_ascii_lowercase();
    let matches = match verify(&payload, &expected).await {
        Ok(matches) => matches,
        Err(UpdateError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %payload.path().display(), "Staged payload is missing");
            return Ok(Verification::Rejected {
                payload,
                actual: "missing".to_string(),
            });
        }
        Err(e) => return Err(e),
    };

    if !matches {
        let actual = calculate_sha256(payload.path()).await?;
        debug!(
            expected = %expected,
            actual = %actual,
            expected_size = payload.size(),
            "Payload rejected"
        );
        return Ok(Verification::Rejected { payload, actual });
    }

    let path = payload.path().to_path_buf();
    let manifest = payload.manifest().clone();
    Ok(Verification::Verified(VerifiedPayload {
        path,
        manifest,
        sha256: expected,
    }))
}

/// Whether the payload's size and full SHA256 digest match `expected`.
pub async fn verify(payload: &DownloadedPayload, expected: &str) -> UpdateResult<bool> {
    let (digest, len) = digest_file(payload.path()).await?;
    let matches = hex::decode(expected.trim())
        .map(|expected| expected.as_slice() == digest.as_slice())
        .unwrap_or(false);
    Ok(matches && len == payload.size())
}

/// Calculate SHA256 checksum of a file.
pub async fn calculate_sha256(path: &Path) -> UpdateResult<String> {
    let (digest, _) = digest_file(path).await?;
    Ok(hex::encode(digest))
}

async fn digest_file(path: &Path) -> UpdateResult<([u8; 32], u64)> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 8192];
    let mut len: u64 = 0;

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        len += n as u64;
    }

    Ok((hasher.finalize().into(), len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::Version;
    use tempfile::TempDir;

    const HELLO_WORLD: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    fn staged(dir: &TempDir, content: &[u8], checksum: &str, size: u64) -> DownloadedPayload {
        let path = dir.path().join("payload.bin");
        std::fs::write(&path, content).unwrap();
        DownloadedPayload::new(
            path,
            UpdateManifest {
                version: Version::parse("5").unwrap(),
                download_url: "https://cdn.example.com/app.apk".to_string(),
                expected_checksum: checksum.to_string(),
                payload_size: size,
                min_compatible_version: None,
            },
        )
    }

    #[tokio::test]
    async fn test_calculate_sha256() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, b"hello world").unwrap();
        assert_eq!(calculate_sha256(&path).await.unwrap(), HELLO_WORLD);
    }

    #[tokio::test]
    async fn test_verify_matching_payload() {
        let dir = TempDir::new().unwrap();
        let payload = staged(&dir, b"hello world", HELLO_WORLD, 11);
        assert!(verify(&payload, HELLO_WORLD).await.unwrap());

        match verify_payload(payload).await.unwrap() {
            Verification::Verified(verified) => {
                assert_eq!(verified.sha256(), HELLO_WORLD);
                assert_eq!(verified.manifest().payload_size, 11);
            }
            Verification::Rejected { actual, .. } => panic!("rejected: {}", actual),
        }
    }

    #[tokio::test]
    async fn test_single_flipped_byte_rejected() {
        let dir = TempDir::new().unwrap();
        let payload = staged(&dir, b"hello worle", HELLO_WORLD, 11);
        assert!(!verify(&payload, HELLO_WORLD).await.unwrap());
        assert!(matches!(
            verify_payload(payload).await.unwrap(),
            Verification::Rejected { .. }
        ));
    }

    #[tokio::test]
    async fn test_uppercase_checksum_accepted() {
        let dir = TempDir::new().unwrap();
        let expected = format!(" {} ", HELLO_WORLD.to_uppercase());
        let payload = staged(&dir, b"hello world", &expected, 11);
        match verify_payload(payload).await.unwrap() {
            Verification::Verified(verified) => assert_eq!(verified.sha256(), HELLO_WORLD),
            Verification::Rejected { actual, .. } => panic!("rejected: {}", actual),
        }
    }

    #[tokio::test]
    async fn test_rejection_reports_actual_digest() {
        let dir = TempDir::new().unwrap();
        let payload = staged(&dir, b"hello world", &"0".repeat(64), 11);
        match verify_payload(payload).await.unwrap() {
            Verification::Rejected { actual, .. } => assert_eq!(actual, HELLO_WORLD),
            Verification::Verified(_) => panic!("wrong checksum verified"),
        }
    }

    #[tokio::test]
    async fn test_size_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        let payload = staged(&dir, b"hello world", HELLO_WORLD, 12);
        assert!(matches!(
            verify_payload(payload).await.unwrap(),
            Verification::Rejected { .. }
        ));
    }

    #[tokio::test]
    async fn test_missing_payload_rejected() {
        let dir = TempDir::new().unwrap();
        let payload = staged(&dir, b"hello world", HELLO_WORLD, 11);
        std::fs::remove_file(payload.path()).unwrap();
        match verify_payload(payload).await.unwrap() {
            Verification::Rejected { actual, .. } => assert_eq!(actual, "missing"),
            Verification::Verified(_) => panic!("missing payload verified"),
        }
    }

    #[tokio::test]
    async fn test_discard_removes_file() {
        let dir = TempDir::new().unwrap();
        let payload = staged(&dir, b"hello world", HELLO_WORLD, 11);
        let path = payload.path().to_path_buf();
        let Verification::Verified(verified) = verify_payload(payload).await.unwrap() else {
            panic!("expected verified payload");
        };
        verified.discard().await.unwrap();
        assert!(!path.exists());
    }
}
