//! Persisted update cycle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, UpdateError, UpdateResult};
use crate::manifest::UpdateManifest;

/// Phase of an update cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    CheckingManifest,
    Downloading,
    Verifying,
    Installing,
    Completed,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::CheckingManifest => "checking_manifest",
            Self::Downloading => "downloading",
            Self::Verifying => "verifying",
            Self::Installing => "installing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Completed and Failed end a cycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Phases that a restarted process resumes instead of starting over.
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            Self::CheckingManifest | Self::Downloading | Self::Verifying | Self::Installing
        )
    }

    /// Phases that cannot exist without a fetched manifest.
    pub fn requires_manifest(&self) -> bool {
        matches!(self, Self::Downloading | Self::Verifying | Self::Installing)
    }

    /// Allowed transitions: strictly forward one step, or to Failed.
    /// CheckingManifest may complete directly when no update is needed.
    pub fn can_advance_to(&self, next: Phase) -> bool {
        use Phase::*;
        match (self, next) {
            (Idle, CheckingManifest)
            | (CheckingManifest, Downloading)
            | (CheckingManifest, Completed)
            | (Downloading, Verifying)
            | (Verifying, Installing)
            | (Installing, Completed) => true,
            (from, Failed) => from.is_in_progress(),
            _ => false,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single live record of agent progress.
///
/// Unknown fields are ignored and missing optional fields default, so a
/// record written by another agent version still loads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateCycleState {
    #[serde(default)]
    pub phase: Phase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<UpdateManifest>,

    /// Bytes durably flushed to the staging file
    #[serde(default)]
    pub bytes_downloaded: u64,

    /// Failed attempts within the current cycle
    #[serde(default)]
    pub attempt_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorKind>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_message: Option<String>,

    /// Earliest time an automatic retry may run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,

    #[serde(default = "Utc::now")]
    pub started_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Default for UpdateCycleState {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateCycleState {
    /// A fresh Idle state.
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            phase: Phase::Idle,
            manifest: None,
            bytes_downloaded: 0,
            attempt_count: 0,
            last_error: None,
            last_error_message: None,
            next_attempt_at: None,
            started_at: now,
            updated_at: now,
        }
    }

    /// Move to the next phase, rejecting skips and backward moves.
    pub fn advance(&mut self, next: Phase) -> UpdateResult<()> {
        if !self.phase.can_advance_to(next) {
            return Err(UpdateError::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        if next.requires_manifest() && self.manifest.is_none() {
            return Err(UpdateError::StateCorrupt {
                message: format!("cannot enter {} without a manifest", next),
            });
        }
        self.phase = next;
        self.next_attempt_at = None;
        self.touch();
        Ok(())
    }

    /// Record a failure that keeps the cycle in its current phase until
    /// `retry_at`.
    pub fn schedule_retry(&mut self, kind: ErrorKind, message: String, retry_at: DateTime<Utc>) {
        self.last_error = Some(kind);
        self.last_error_message = Some(message);
        self.next_attempt_at = Some(retry_at);
        self.touch();
    }

    /// End the cycle as Failed. The payload is gone, so progress resets.
    pub fn fail(&mut self, kind: ErrorKind, message: String, retry_at: Option<DateTime<Utc>>) {
        self.phase = Phase::Failed;
        self.bytes_downloaded = 0;
        self.last_error = Some(kind);
        self.last_error_message = Some(message);
        self.next_attempt_at = retry_at;
        self.touch();
    }

    /// Begin a new cycle. `keep_attempts` carries the failure count across
    /// automatic retries so the attempt cap still bounds them.
    pub fn restart(&mut self, keep_attempts: bool) {
        let attempts = if keep_attempts { self.attempt_count } else { 0 };
        *self = Self::new();
        self.attempt_count = attempts;
    }

    /// Record durable download progress.
    pub fn set_bytes_downloaded(&mut self, bytes: u64) -> UpdateResult<()> {
        let size = self.manifest.as_ref().map(|m| m.payload_size).unwrap_or(0);
        if bytes > size {
            return Err(UpdateError::StateCorrupt {
                message: format!("{} bytes downloaded exceeds payload size {}", bytes, size),
            });
        }
        self.bytes_downloaded = bytes;
        self.touch();
        Ok(())
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
        self.last_error_message = None;
        self.next_attempt_at = None;
    }

    /// Whether an automatic retry is allowed at `now`.
    pub fn retry_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.is_none_or(|at| at <= now)
    }

    /// Check the structural invariants of a loaded record.
    pub fn validate(&self) -> UpdateResult<()> {
        if self.phase.requires_manifest() && self.manifest.is_none() {
            return Err(UpdateError::StateCorrupt {
                message: format!("phase {} has no manifest", self.phase),
            });
        }
        match &self.manifest {
            Some(manifest) if self.bytes_downloaded > manifest.payload_size => {
                Err(UpdateError::StateCorrupt {
                    message: format!(
                        "{} bytes downloaded exceeds payload size {}",
                        self.bytes_downloaded, manifest.payload_size
                    ),
                })
            }
            None if self.bytes_downloaded > 0 => Err(UpdateError::StateCorrupt {
                message: "download progress recorded without a manifest".to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
