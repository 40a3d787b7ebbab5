use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::sync::Notify;

use crate::backoff::RetryPolicy;
use crate::download::{PackageDownloader, PayloadTransport, TransferStream};
use crate::error::{UpdateError, UpdateResult};
use crate::install::{InstallFailure, InstallReport, Installer};
use crate::installed::InstalledVersion;
use crate::manifest::{ManifestFetcher, UpdateManifest};
use crate::orchestrator::{Collaborators, UpdateOrchestrator};
use crate::store::StateStore;
use crate::verify::VerifiedPayload;
use crate::version::Version;

pub fn payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn manifest_for(version: &str, data: &[u8]) -> UpdateManifest {
    UpdateManifest {
        version: Version::parse(version).unwrap(),
        download_url: "https://cdn.example.com/app.apk".to_string(),
        expected_checksum: sha256_hex(data),
        payload_size: data.len() as u64,
        min_compatible_version: None,
    }
}

/// Serves a scripted manifest, failing the first `failures` fetches.
pub struct FakeFetcher {
    pub manifest: Mutex<UpdateManifest>,
    pub failures: AtomicUsize,
    pub calls: AtomicUsize,
}

impl FakeFetcher {
    pub fn new(manifest: UpdateManifest) -> Self {
        Self {
            manifest: Mutex::new(manifest),
            failures: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ManifestFetcher for FakeFetcher {
    async fn fetch(&self) -> UpdateResult<UpdateManifest> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(UpdateError::ConnectionFailed {
                message: "network unreachable".to_string(),
            });
        }
        Ok(self.manifest.lock().clone())
    }
}

/// In-memory payload source with scriptable interruptions.
pub struct MemoryTransport {
    pub payload: Vec<u8>,
    /// Drop the connection after this many bytes of the next transfer
    pub fail_after: Mutex<Option<usize>>,
    /// Stop sending (without closing) after this many bytes
    pub stall_after: Mutex<Option<usize>>,
    pub offsets: Mutex<Vec<u64>>,
    pub opened: Notify,
}

impl MemoryTransport {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            fail_after: Mutex::new(None),
            stall_after: Mutex::new(None),
            offsets: Mutex::new(Vec::new()),
            opened: Notify::new(),
        }
    }

    pub fn offsets(&self) -> Vec<u64> {
        self.offsets.lock().clone()
    }
}

#[async_trait]
impl PayloadTransport for MemoryTransport {
    async fn open(&self, _url: &str, offset: u64) -> UpdateResult<TransferStream> {
        self.offsets.lock().push(offset);
        let start = (offset as usize).min(self.payload.len());
        let fail_after = self.fail_after.lock().take();
        let stall_after = *self.stall_after.lock();
        let end = fail_after
            .or(stall_after)
            .map_or(self.payload.len(), |n| n.clamp(start, self.payload.len()));

        let chunks: Vec<UpdateResult<Bytes>> = self.payload[start..end]
            .chunks(100)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        let body = stream::iter(chunks);

        let body = if fail_after.is_some() {
            body.chain(stream::iter(vec![Err(UpdateError::DownloadFailed {
                message: "connection reset".to_string(),
            })]))
            .boxed()
        } else if stall_after.is_some() {
            body.chain(stream::pending()).boxed()
        } else {
            body.boxed()
        };

        self.opened.notify_one();
        Ok(TransferStream {
            resumed_from: offset,
            body,
        })
    }
}

/// Installed version shared with [`FakeInstaller`], which bumps it on success.
pub struct SharedVersion(pub Mutex<Option<Version>>);

impl SharedVersion {
    pub fn new(version: Option<&str>) -> Self {
        Self(Mutex::new(version.map(|v| Version::parse(v).unwrap())))
    }

    pub fn set(&self, version: Option<&str>) {
        *self.0.lock() = version.map(|v| Version::parse(v).unwrap());
    }
}

#[async_trait]
impl InstalledVersion for SharedVersion {
    async fn installed_version(&self) -> UpdateResult<Option<Version>> {
        Ok(self.0.lock().clone())
    }
}

pub struct FakeInstaller {
    pub installed: Arc<SharedVersion>,
    pub fail: Mutex<bool>,
    /// Digest of every payload handed to the installer
    pub calls: Mutex<Vec<String>>,
}

impl FakeInstaller {
    pub fn calls(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl Installer for FakeInstaller {
    async fn install(&self, payload: &VerifiedPayload) -> Result<InstallReport, InstallFailure> {
        self.calls.lock().push(payload.sha256().to_string());
        assert!(payload.path().exists(), "installer received a missing payload");
        if *self.fail.lock() {
            return Err(InstallFailure::new("Failure [INSTALL_FAILED_INSUFFICIENT_STORAGE]"));
        }
        *self.installed.0.lock() = Some(payload.manifest().version.clone());
        Ok(InstallReport {
            diagnostic: "Success".to_string(),
        })
    }
}

/// Everything a cycle needs, rooted in one temp directory that survives
/// simulated restarts.
pub struct Harness {
    pub dir: TempDir,
    pub fetcher: Arc<FakeFetcher>,
    pub transport: Arc<MemoryTransport>,
    pub installed: Arc<SharedVersion>,
    pub installer: Arc<FakeInstaller>,
    pub retry: RetryPolicy,
}

impl Harness {
    /// Payload of `size` bytes published as `version`.
    pub fn new(version: &str, size: usize, installed: Option<&str>) -> Self {
        let data = payload(size);
        let installed = Arc::new(SharedVersion::new(installed));
        Self {
            dir: TempDir::new().unwrap(),
            fetcher: Arc::new(FakeFetcher::new(manifest_for(version, &data))),
            transport: Arc::new(MemoryTransport::new(data)),
            installer: Arc::new(FakeInstaller {
                installed: installed.clone(),
                fail: Mutex::new(false),
                calls: Mutex::new(Vec::new()),
            }),
            installed,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay_secs: 60,
                max_delay_secs: 600,
                jitter: 0.0,
            },
        }
    }

    pub fn store(&self) -> StateStore {
        StateStore::new(self.dir.path())
    }

    pub fn staging_path(&self) -> std::path::PathBuf {
        self.dir.path().join("staging").join("payload.bin")
    }

    pub fn manifest(&self) -> UpdateManifest {
        self.fetcher.manifest.lock().clone()
    }

    /// A fresh orchestrator over the persisted state, as after a restart.
    pub async fn orchestrator(&self) -> UpdateOrchestrator {
        let downloader = PackageDownloader::new(
            self.transport.clone(),
            self.staging_path(),
            Duration::from_secs(5),
            250,
        );
        UpdateOrchestrator::new(
            self.store(),
            Collaborators {
                fetcher: self.fetcher.clone(),
                downloader,
                installer: self.installer.clone(),
                installed: self.installed.clone(),
            },
            self.retry.clone(),
        )
        .await
        .unwrap()
    }
}
