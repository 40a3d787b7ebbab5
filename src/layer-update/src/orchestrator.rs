//! The update cycle state machine.
//!
//! One [`UpdateOrchestrator`] owns the single live [`UpdateCycleState`]
//! behind an async mutex, so cycles never overlap. Every phase transition is
//! persisted before the next stage starts, which lets a restarted process
//! continue from the last recorded phase.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::RetryPolicy;
use crate::client::build_http_client;
use crate::config::AgentConfig;
use crate::download::{
    CheckpointSink, DownloadProgress, DownloadedPayload, HttpTransport, PackageDownloader,
};
use crate::error::{ErrorKind, UpdateError, UpdateResult};
use crate::install::{CommandInstaller, Installer};
use crate::installed::{self, InstalledVersion};
use crate::manifest::{HttpManifestFetcher, ManifestFetcher, UpdateManifest};
use crate::state::{Phase, UpdateCycleState};
use crate::store::StateStore;
use crate::verify::{Verification, VerifiedPayload, verify_payload};
use crate::version::Version;

/// Why a cycle was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeReason {
    Boot,
    Periodic,
    NetworkAvailable,
    Manual,
    /// A scheduled retry came due
    Retry,
}

impl WakeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Boot => "boot",
            Self::Periodic => "periodic",
            Self::NetworkAvailable => "network_available",
            Self::Manual => "manual",
            Self::Retry => "retry",
        }
    }

    /// External triggers ignore backoff and start over after a finished cycle.
    pub fn is_external(&self) -> bool {
        !matches!(self, Self::Retry)
    }

    fn priority(&self) -> u8 {
        match self {
            Self::Manual => 4,
            Self::Boot => 3,
            Self::NetworkAvailable => 2,
            Self::Periodic => 1,
            Self::Retry => 0,
        }
    }

    /// Combine two pending wakes into the one that should run.
    pub fn merge(self, other: Self) -> Self {
        if other.priority() > self.priority() {
            other
        } else {
            self
        }
    }
}

impl std::fmt::Display for WakeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one [`UpdateOrchestrator::run_cycle`] call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// The installed version is current
    UpToDate {
        installed: Option<Version>,
        available: Version,
    },
    /// A new version was installed
    Installed { version: Version, diagnostic: String },
    /// A retriable failure; the cycle stays in `phase` until `at`
    RetryScheduled {
        phase: Phase,
        error: ErrorKind,
        at: DateTime<Utc>,
    },
    /// The cycle ended as Failed
    Failed {
        error: ErrorKind,
        message: String,
        retry_at: Option<DateTime<Utc>>,
    },
    /// A retry wake arrived before the backoff elapsed
    Deferred { until: DateTime<Utc> },
    /// A retry wake arrived with no retry pending
    Skipped { phase: Phase },
    /// The transfer was cancelled; flushed progress is kept
    Cancelled { bytes_downloaded: u64 },
}

impl CycleOutcome {
    /// When the scheduler should wake the orchestrator again on its own.
    pub fn retry_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::RetryScheduled { at, .. } => Some(*at),
            Self::Failed { retry_at, .. } => *retry_at,
            Self::Deferred { until } => Some(*until),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::UpToDate { .. } | Self::Installed { .. })
    }
}

/// The components a cycle drives.
pub struct Collaborators {
    pub fetcher: Arc<dyn ManifestFetcher>,
    pub downloader: PackageDownloader,
    pub installer: Arc<dyn Installer>,
    pub installed: Arc<dyn InstalledVersion>,
}

/// Drives update cycles and owns their persisted state.
pub struct UpdateOrchestrator {
    store: StateStore,
    fetcher: Arc<dyn ManifestFetcher>,
    downloader: PackageDownloader,
    installer: Arc<dyn Installer>,
    installed: Arc<dyn InstalledVersion>,
    retry: RetryPolicy,
    state: Mutex<UpdateCycleState>,
    /// Cancels the transfer of the running cycle
    transfer: parking_lot::Mutex<CancellationToken>,
}

impl UpdateOrchestrator {
    /// Create an orchestrator, loading (and if necessary recovering) the
    /// persisted state.
    pub async fn new(
        store: StateStore,
        collaborators: Collaborators,
        retry: RetryPolicy,
    ) -> UpdateResult<Self> {
        let state = store.load().await?;
        if state.phase.is_in_progress() {
            info!(
                phase = %state.phase,
                bytes = state.bytes_downloaded,
                attempts = state.attempt_count,
                "Resuming interrupted update cycle"
            );
        }

        Ok(Self {
            store,
            fetcher: collaborators.fetcher,
            downloader: collaborators.downloader,
            installer: collaborators.installer,
            installed: collaborators.installed,
            retry,
            state: Mutex::new(state),
            transfer: parking_lot::Mutex::new(CancellationToken::new()),
        })
    }

    /// Wire the HTTP, command and file based collaborators from config.
    pub async fn from_config(config: &AgentConfig) -> UpdateResult<Self> {
        let client = build_http_client(&config.network)?;
        let fetcher = HttpManifestFetcher::new(
            client.clone(),
            &config.manifest_url,
            config.network.request_timeout(),
        )?;
        let downloader = PackageDownloader::new(
            Arc::new(HttpTransport::new(client)),
            config.staging_path(),
            config.network.chunk_timeout(),
            config.network.checkpoint_interval_bytes,
        );

        let collaborators = Collaborators {
            fetcher: Arc::new(fetcher),
            downloader,
            installer: Arc::new(CommandInstaller::from_config(&config.installer)),
            installed: installed::from_source(&config.installed_version)?,
        };

        Self::new(
            StateStore::new(config.state_dir()),
            collaborators,
            config.retry.clone(),
        )
        .await
    }

    /// Snapshot of the current state. Waits for a running cycle to finish.
    pub async fn state(&self) -> UpdateCycleState {
        self.state.lock().await.clone()
    }

    /// When the next automatic retry is due, if one is pending.
    pub async fn next_attempt_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.next_attempt_at
    }

    /// Abort the in-flight download, if any. Never blocks.
    pub fn cancel_transfer(&self) {
        self.transfer.lock().cancel();
    }

    /// Cancel any transfer and flush the state to disk.
    pub async fn shutdown(&self) -> UpdateResult<()> {
        self.cancel_transfer();
        let state = self.state.lock().await;
        self.store.save(&state).await?;
        info!(phase = %state.phase, "Update state flushed");
        Ok(())
    }

    /// Drop all progress and start from a clean Idle state.
    pub async fn reset(&self) -> UpdateResult<()> {
        let mut state = self.state.lock().await;
        self.downloader.clear_staging().await?;
        *state = UpdateCycleState::new();
        self.store.save(&state).await?;
        info!("Update state reset");
        Ok(())
    }

    /// Run one update cycle.
    ///
    /// Never returns an error: failures are recorded in the state and
    /// reported through the outcome. Concurrent calls run one after another.
    pub async fn run_cycle(&self, reason: WakeReason) -> CycleOutcome {
        let mut state = self.state.lock().await;

        let cancel = CancellationToken::new();
        *self.transfer.lock() = cancel.clone();

        if let Some(outcome) = self.prepare(&mut state, reason) {
            debug!(reason = %reason, outcome = ?outcome, "Wake ignored");
            return outcome;
        }

        info!(reason = %reason, phase = %state.phase, "Starting update cycle");
        let outcome = match self.advance(&mut state, &cancel).await {
            Ok(outcome) => outcome,
            Err(e) => self.handle_failure(&mut state, e).await,
        };
        info!(reason = %reason, phase = %state.phase, outcome = ?outcome, "Update cycle finished");
        outcome
    }

    /// Apply the wake rules. Returns an outcome when the wake must not run
    /// a cycle.
    fn prepare(&self, state: &mut UpdateCycleState, reason: WakeReason) -> Option<CycleOutcome> {
        let now = Utc::now();

        if reason.is_external() {
            if state.phase.is_terminal() {
                state.restart(false);
            }
            return None;
        }

        if let Some(until) = state.next_attempt_at.filter(|_| !state.retry_due(now)) {
            return Some(CycleOutcome::Deferred { until });
        }

        match state.phase {
            Phase::Failed if state.next_attempt_at.is_some() => {
                state.restart(true);
                None
            }
            Phase::Failed => Some(CycleOutcome::Failed {
                error: state.last_error.unwrap_or(ErrorKind::NetworkError),
                message: state.last_error_message.clone().unwrap_or_default(),
                retry_at: None,
            }),
            Phase::Completed => Some(CycleOutcome::Skipped { phase: state.phase }),
            _ => None,
        }
    }

    async fn advance(
        &self,
        state: &mut UpdateCycleState,
        cancel: &CancellationToken,
    ) -> UpdateResult<CycleOutcome> {
        if state.phase == Phase::Idle {
            state.advance(Phase::CheckingManifest)?;
            self.store.save(state).await?;
        }

        if state.phase == Phase::CheckingManifest {
            if let Some(outcome) = self.check_manifest(state).await? {
                return Ok(outcome);
            }
        }

        let mut downloaded = None;
        if state.phase == Phase::Downloading {
            downloaded = Some(self.download(state, cancel).await?);
            state.advance(Phase::Verifying)?;
            self.store.save(state).await?;
        }

        let mut verified = None;
        if state.phase == Phase::Verifying {
            let payload = match downloaded.take() {
                Some(payload) => payload,
                None => self.downloader.staged_payload(current_manifest(state)?),
            };
            verified = Some(self.verify(payload).await?);
            state.advance(Phase::Installing)?;
            self.store.save(state).await?;
        }

        if state.phase == Phase::Installing {
            return match verified {
                Some(payload) => self.install(state, payload).await,
                None => self.confirm_interrupted_install(state).await,
            };
        }

        Err(UpdateError::InvalidTransition {
            from: state.phase,
            to: Phase::CheckingManifest,
        })
    }

    /// Fetch the manifest and decide whether an update is needed.
    async fn check_manifest(&self, state: &mut UpdateCycleState) -> UpdateResult<Option<CycleOutcome>> {
        let manifest = self.fetcher.fetch().await?;
        let installed = self.installed.installed_version().await?;
        debug!(
            available = %manifest.version,
            installed = ?installed.as_ref().map(Version::as_str),
            "Manifest fetched"
        );

        if let Some(current) = &installed {
            if manifest.version <= *current {
                let available = manifest.version.clone();
                state.manifest = Some(manifest);
                state.advance(Phase::Completed)?;
                self.finish(state).await?;
                info!(installed = %current, available = %available, "Already up to date");
                return Ok(Some(CycleOutcome::UpToDate {
                    installed,
                    available,
                }));
            }
            if let Some(minimum) = &manifest.min_compatible_version {
                if current < minimum {
                    return Err(UpdateError::IncompatibleVersion {
                        installed: current.to_string(),
                        minimum: minimum.to_string(),
                    });
                }
            }
        }

        info!(
            version = %manifest.version,
            size = manifest.payload_size,
            "Update available"
        );
        self.downloader.clear_staging().await?;
        state.manifest = Some(manifest);
        state.bytes_downloaded = 0;
        state.advance(Phase::Downloading)?;
        self.store.save(state).await?;
        Ok(None)
    }

    async fn download(
        &self,
        state: &mut UpdateCycleState,
        cancel: &CancellationToken,
    ) -> UpdateResult<DownloadedPayload> {
        let manifest = current_manifest(state)?.clone();
        let resume_offset = state.bytes_downloaded;
        if resume_offset > 0 {
            info!(offset = resume_offset, "Resuming download");
        }

        let mut sink = StateCheckpoint {
            state,
            store: &self.store,
        };
        self.downloader
            .download(&manifest, resume_offset, &mut sink, cancel)
            .await
    }

    /// Verify the payload, discarding it on mismatch.
    async fn verify(&self, payload: DownloadedPayload) -> UpdateResult<VerifiedPayload> {
        let expected = payload.manifest().expected_checksum.clone();
        match verify_payload(payload).await? {
            Verification::Verified(verified) => {
                info!(sha256 = %verified.sha256(), "Payload verified");
                Ok(verified)
            }
            Verification::Rejected { payload, actual } => {
                warn!(expected = %expected, actual = %actual, "Payload failed integrity check");
                if let Err(e) = payload.discard().await {
                    warn!(error = %e, "Failed to delete rejected payload");
                }
                Err(UpdateError::ChecksumMismatch { expected, actual })
            }
        }
    }

    async fn install(
        &self,
        state: &mut UpdateCycleState,
        payload: VerifiedPayload,
    ) -> UpdateResult<CycleOutcome> {
        let version = payload.manifest().version.clone();
        info!(version = %version, "Installing update");

        let result = self.installer.install(&payload).await;
        if let Err(e) = payload.discard().await {
            warn!(error = %e, "Failed to delete installed payload");
        }

        match result {
            Ok(report) => {
                state.advance(Phase::Completed)?;
                self.finish(state).await?;
                info!(version = %version, "Update installed");
                Ok(CycleOutcome::Installed {
                    version,
                    diagnostic: report.diagnostic,
                })
            }
            Err(failure) => Err(UpdateError::InstallFailed {
                message: failure.diagnostic,
            }),
        }
    }

    /// The process stopped while the installer was running. The installer
    /// is never invoked twice for a payload, so only its effect is checked.
    async fn confirm_interrupted_install(
        &self,
        state: &mut UpdateCycleState,
    ) -> UpdateResult<CycleOutcome> {
        let version = current_manifest(state)?.version.clone();
        let installed = self.installed.installed_version().await?;

        if installed.as_ref().is_some_and(|current| *current >= version) {
            if let Err(e) = self.downloader.clear_staging().await {
                warn!(error = %e, "Failed to delete installed payload");
            }
            state.advance(Phase::Completed)?;
            self.finish(state).await?;
            info!(version = %version, "Interrupted installation had completed");
            return Ok(CycleOutcome::Installed {
                version,
                diagnostic: "installation confirmed after restart".to_string(),
            });
        }

        Err(UpdateError::InstallFailed {
            message: format!(
                "installation of {} was interrupted (installed: {})",
                version,
                installed
                    .as_ref()
                    .map(Version::as_str)
                    .unwrap_or("none")
            ),
        })
    }

    /// Persist a successfully completed cycle.
    async fn finish(&self, state: &mut UpdateCycleState) -> UpdateResult<()> {
        state.attempt_count = 0;
        state.clear_error();
        self.store.save(state).await
    }

    async fn handle_failure(&self, state: &mut UpdateCycleState, err: UpdateError) -> CycleOutcome {
        if matches!(err, UpdateError::Cancelled) {
            info!(bytes = state.bytes_downloaded, "Download cancelled");
            self.persist_best_effort(state).await;
            return CycleOutcome::Cancelled {
                bytes_downloaded: state.bytes_downloaded,
            };
        }

        let kind = err.kind();
        let message = err.to_string();
        let phase = state.phase;

        let outcome = match phase {
            Phase::CheckingManifest | Phase::Downloading if kind.is_retriable() => {
                state.attempt_count += 1;
                if self.retry.exhausted(state.attempt_count) {
                    warn!(
                        phase = %phase,
                        attempts = state.attempt_count,
                        error = %message,
                        "Retries exhausted, waiting for an external trigger"
                    );
                    self.fail(state, kind, message, None).await
                } else {
                    let at = self.retry.next_attempt_at(state.attempt_count, Utc::now());
                    warn!(
                        phase = %phase,
                        attempt = state.attempt_count,
                        retry_at = %at,
                        error = %message,
                        "Update step failed, retry scheduled"
                    );
                    state.schedule_retry(kind, message, at);
                    CycleOutcome::RetryScheduled {
                        phase,
                        error: kind,
                        at,
                    }
                }
            }
            Phase::Verifying if kind == ErrorKind::IntegrityViolation => {
                state.attempt_count += 1;
                let retry_at = (!self.retry.exhausted(state.attempt_count))
                    .then(|| self.retry.next_attempt_at(state.attempt_count, Utc::now()));
                self.fail(state, kind, message, retry_at).await
            }
            _ => {
                error!(phase = %phase, kind = %kind, error = %message, "Update cycle failed");
                self.fail(state, kind, message, None).await
            }
        };

        self.persist_best_effort(state).await;
        outcome
    }

    async fn fail(
        &self,
        state: &mut UpdateCycleState,
        kind: ErrorKind,
        message: String,
        retry_at: Option<DateTime<Utc>>,
    ) -> CycleOutcome {
        if let Err(e) = self.downloader.clear_staging().await {
            warn!(error = %e, "Failed to delete staged payload");
        }
        state.fail(kind, message.clone(), retry_at);
        CycleOutcome::Failed {
            error: kind,
            message,
            retry_at,
        }
    }

    async fn persist_best_effort(&self, state: &UpdateCycleState) {
        if let Err(e) = self.store.save(state).await {
            error!(error = %e, "Failed to persist update state");
        }
    }
}

fn current_manifest(state: &UpdateCycleState) -> UpdateResult<&UpdateManifest> {
    state.manifest.as_ref().ok_or_else(|| UpdateError::StateCorrupt {
        message: format!("phase {} has no manifest", state.phase),
    })
}

/// Records download checkpoints in the cycle state.
struct StateCheckpoint<'a> {
    state: &'a mut UpdateCycleState,
    store: &'a StateStore,
}

#[async_trait]
impl CheckpointSink for StateCheckpoint<'_> {
    async fn checkpoint(&mut self, progress: DownloadProgress) -> UpdateResult<()> {
        self.state.set_bytes_downloaded(progress.downloaded)?;
        self.store.save(self.state).await
    }
}
