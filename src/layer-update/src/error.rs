//! Error types for layer-update.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::Phase;

/// Result type for update operations.
pub type UpdateResult<T> = std::result::Result<T, UpdateError>;

/// Failure category recorded in the persisted cycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transport failure, timeout or non-success HTTP status
    NetworkError,
    /// Manifest failed schema or field validation
    MalformedManifest,
    /// Payload checksum did not match the manifest
    IntegrityViolation,
    /// The platform installer reported failure
    InstallationFailed,
    /// Persisted state was unreadable or inconsistent
    StorageCorruption,
    /// Installed version is below the manifest's minimum compatible version
    IncompatibleVersion,
    /// The installed version of the target package could not be determined
    VersionProbeFailed,
    /// Local filesystem or configuration failure on the device
    LocalFailure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkError => "network_error",
            Self::MalformedManifest => "malformed_manifest",
            Self::IntegrityViolation => "integrity_violation",
            Self::InstallationFailed => "installation_failed",
            Self::StorageCorruption => "storage_corruption",
            Self::IncompatibleVersion => "incompatible_version",
            Self::VersionProbeFailed => "version_probe_failed",
            Self::LocalFailure => "local_failure",
        }
    }

    /// Whether a cycle failing with this kind may be retried automatically.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::NetworkError
                | Self::MalformedManifest
                | Self::IntegrityViolation
                | Self::VersionProbeFailed
                | Self::LocalFailure
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during update operations.
#[derive(Debug, Error)]
pub enum UpdateError {
    // Network errors
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Failed to connect to update server: {message}")]
    ConnectionFailed { message: String },

    #[error("Update server returned error {status}: {message}")]
    ServerError { status: u16, message: String },

    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: &'static str, seconds: u64 },

    // Manifest errors
    #[error("Malformed manifest: {message}")]
    MalformedManifest { message: String },

    #[error("Invalid version format: {version}")]
    InvalidVersion { version: String },

    #[error("Installed version {installed} is older than minimum compatible version {minimum}")]
    IncompatibleVersion { installed: String, minimum: String },

    // Download errors
    #[error("Download failed: {message}")]
    DownloadFailed { message: String },

    #[error("Transfer cancelled")]
    Cancelled,

    // Verification errors
    #[error("SHA256 verification failed: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    // Installation errors
    #[error("Installation failed: {message}")]
    InstallFailed { message: String },

    #[error("Failed to query installed version: {message}")]
    VersionProbe { message: String },

    // State errors
    #[error("Persisted state is invalid: {message}")]
    StateCorrupt { message: String },

    #[error("Invalid phase transition from {from} to {to}")]
    InvalidTransition { from: Phase, to: Phase },

    // File system errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Config errors
    #[error("Invalid configuration: {message}")]
    ConfigError { message: String },
}

impl UpdateError {
    /// Map this error onto the persisted failure taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MalformedManifest { .. } | Self::InvalidVersion { .. } => {
                ErrorKind::MalformedManifest
            }
            Self::IncompatibleVersion { .. } => ErrorKind::IncompatibleVersion,
            Self::ChecksumMismatch { .. } => ErrorKind::IntegrityViolation,
            Self::InstallFailed { .. } => ErrorKind::InstallationFailed,
            Self::VersionProbe { .. } => ErrorKind::VersionProbeFailed,
            Self::StateCorrupt { .. } | Self::InvalidTransition { .. } | Self::Json(_) => {
                ErrorKind::StorageCorruption
            }
            Self::Network(_)
            | Self::ConnectionFailed { .. }
            | Self::ServerError { .. }
            | Self::Timeout { .. }
            | Self::DownloadFailed { .. }
            | Self::Cancelled => ErrorKind::NetworkError,
            Self::Io(_) | Self::ConfigError { .. } => ErrorKind::LocalFailure,
        }
    }

    /// Check if this error is retriable.
    pub fn is_retriable(&self) -> bool {
        self.kind().is_retriable()
    }
}
