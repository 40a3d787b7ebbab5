//! Layer Update - resumable update agent for the Layer display package.
//!
//! The agent discovers, downloads, verifies and installs updates for a single
//! target package. Every stage is checkpointed to a durable state record so a
//! cycle interrupted by a crash, reboot or network loss continues where it
//! stopped instead of starting over.
//!
//! Components, leaf-first:
//! - [`StateStore`] - crash-safe persistence of [`UpdateCycleState`]
//! - [`ManifestFetcher`] - retrieves the current [`UpdateManifest`]
//! - [`PackageDownloader`] - resumable, checkpointed payload transfer
//! - [`verify`] - SHA256 integrity verification
//! - [`Installer`] - opaque platform installation boundary
//! - [`UpdateOrchestrator`] - the state machine driving one cycle
//! - [`Scheduler`] - periodic timer plus coalesced external wake signals
//!
//! # Example
//!
//! ```rust,ignore
//! use layer_update::{AgentConfig, Scheduler, UpdateOrchestrator, WakeReason};
//!
//! let config = AgentConfig::default();
//! let orchestrator = Arc::new(UpdateOrchestrator::from_config(&config).await?);
//! let scheduler = Scheduler::new(orchestrator, config.check_interval());
//! let handle = scheduler.handle();
//!
//! handle.wake(WakeReason::Boot);
//! scheduler.run().await;
//! ```

mod backoff;
mod client;
mod command;
mod config;
mod download;
mod error;
mod install;
mod installed;
mod manifest;
mod orchestrator;
mod scheduler;
mod state;
mod store;
pub mod verify;
mod version;

#[cfg(test)]
mod tests;

pub use backoff::RetryPolicy;
pub use client::build_http_client;
pub use command::{CommandOutput, run_command};
pub use config::{AgentConfig, CommandSpec, InstallerConfig, NetworkConfig, VersionSource};
pub use download::{
    CheckpointSink, DownloadProgress, DownloadedPayload, HttpTransport, PackageDownloader,
    PayloadTransport, TransferStream,
};
pub use error::{ErrorKind, UpdateError, UpdateResult};
pub use install::{
    CommandInstaller, InstallFailure, InstallReport, Installer, run_startup_commands,
};
pub use installed::{FixedVersion, InstalledVersion, VersionCommand, VersionFile};
pub use manifest::{HttpManifestFetcher, ManifestFetcher, UpdateManifest};
pub use orchestrator::{Collaborators, CycleOutcome, UpdateOrchestrator, WakeReason};
pub use scheduler::{CycleRunner, Scheduler, SchedulerHandle};
pub use state::{Phase, UpdateCycleState};
pub use store::{STATE_FILE_NAME, StateStore};
pub use verify::{Verification, VerifiedPayload};
pub use version::Version;

/// Version of the agent itself (set at compile time)
pub const CURRENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default manifest endpoint of the Layer distribution CDN
pub const DEFAULT_MANIFEST_URL: &str = "https://layer-android.b-cdn.net/manifest.json";
