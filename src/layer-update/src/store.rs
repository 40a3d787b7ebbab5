//! Crash-safe persistence of the update cycle state.
//!
//! The record is a single JSON file. Writes go to a temp file in the same
//! directory, are synced, then renamed over the record, so a crash during a
//! checkpoint leaves either the previous or the new state on disk.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{ErrorKind, UpdateError, UpdateResult};
use crate::state::UpdateCycleState;

/// Fixed name of the state record.
pub const STATE_FILE_NAME: &str = "update-state.json";

/// Durable store for the single [`UpdateCycleState`] record.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Create a store keeping its record in `dir`.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(STATE_FILE_NAME),
        }
    }

    /// Get the record path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the record without any recovery. `Ok(None)` if none exists.
    pub async fn read(&self) -> UpdateResult<Option<UpdateCycleState>> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state: UpdateCycleState =
            serde_json::from_slice(&bytes).map_err(|e| UpdateError::StateCorrupt {
                message: e.to_string(),
            })?;
        state.validate()?;
        Ok(Some(state))
    }

    /// Load the record for a new process.
    ///
    /// An unreadable or inconsistent record is moved aside and replaced by
    /// a fresh Idle state carrying [`ErrorKind::StorageCorruption`].
    pub async fn load(&self) -> UpdateResult<UpdateCycleState> {
        self.remove_stale_temp_files().await;

        match self.read().await {
            Ok(Some(state)) => {
                debug!(phase = %state.phase, bytes = state.bytes_downloaded, "Loaded update state");
                Ok(state)
            }
            Ok(None) => Ok(UpdateCycleState::new()),
            Err(e @ UpdateError::Io(_)) => Err(e),
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Update state is unreadable, resumability lost; starting a fresh cycle"
                );
                self.quarantine().await;

                let mut state = UpdateCycleState::new();
                state.last_error = Some(ErrorKind::StorageCorruption);
                state.last_error_message = Some(e.to_string());
                Ok(state)
            }
        }
    }

    /// Persist the record atomically.
    pub async fn save(&self, state: &UpdateCycleState) -> UpdateResult<()> {
        let content = serde_json::to_vec_pretty(state)?;
        atomic_write(&self.path, &content).await?;
        debug!(phase = %state.phase, bytes = state.bytes_downloaded, "Update state saved");
        Ok(())
    }

    async fn quarantine(&self) {
        let mut target = self.path.clone().into_os_string();
        target.push(".corrupt");
        if let Err(e) = fs::rename(&self.path, &target).await {
            warn!(error = %e, "Failed to move corrupt update state aside");
        }
    }

    /// Temp files left behind by a write that never reached its rename.
    async fn remove_stale_temp_files(&self) {
        let Some(parent) = self.path.parent() else {
            return;
        };
        let Ok(mut entries) = fs::read_dir(parent).await else {
            return;
        };
        let prefix = temp_prefix(&self.path);
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(&prefix) {
                debug!(file = %entry.path().display(), "Removing interrupted state write");
                if let Err(e) = fs::remove_file(entry.path()).await {
                    warn!(file = %entry.path().display(), error = %e, "Failed to remove interrupted state write");
                }
            }
        }
    }
}

fn temp_prefix(path: &Path) -> String {
    format!(
        ".{}.tmp.",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(STATE_FILE_NAME)
    )
}

/// Perform an atomic write operation: write to temp file, then rename.
/// This ensures readers never see partial content.
async fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "Cannot determine parent directory",
        )
    })?;

    fs::create_dir_all(parent).await?;

    // Temp file in the same directory so the rename stays on one filesystem
    let temp_path = parent.join(format!("{}{}", temp_prefix(path), std::process::id()));

    let mut file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&temp_path)
        .await?;
    file.write_all(content).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    if let Err(e) = fs::rename(&temp_path, path).await {
        if let Err(cleanup) = fs::remove_file(&temp_path).await {
            debug!(file = %temp_path.display(), error = %cleanup, "Failed to remove temp file");
        }
        return Err(e);
    }

    // Persist the directory entry of the rename
    #[cfg(unix)]
    {
        let synced = match fs::File::open(parent).await {
            Ok(dir) => dir.sync_all().await,
            Err(e) => Err(e),
        };
        if let Err(e) = synced {
            warn!(dir = %parent.display(), error = %e, "Failed to sync state directory");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::UpdateManifest;
    use crate::state::Phase;
    use crate::version::Version;
    use tempfile::TempDir;

    fn downloading_state() -> UpdateCycleState {
        let mut state = UpdateCycleState::new();
        state.phase = Phase::Downloading;
        state.manifest = Some(UpdateManifest {
            version: Version::parse("5").unwrap(),
            download_url: "https://cdn.example.com/app.apk".to_string(),
            expected_checksum: "ab".repeat(32),
            payload_size: 1000,
            min_compatible_version: None,
        });
        state.bytes_downloaded = 512;
        state
    }

    #[tokio::test]
    async fn test_load_missing_is_idle() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let state = store.load().await.unwrap();
        assert_eq!(state.phase, Phase::Idle);
        assert!(state.last_error.is_none());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("nested"));
        let state = downloading_state();
        store.save(&state).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn test_interrupted_write_keeps_previous_state() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let state = downloading_state();
        store.save(&state).await.unwrap();

        // A crash between writing the temp file and renaming it
        let temp = dir.path().join(format!("{}4242", temp_prefix(store.path())));
        std::fs::write(&temp, b"{\"phase\":\"verif").unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, state);
        assert!(!temp.exists());
    }

    #[tokio::test]
    async fn test_torn_record_resets_to_idle() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let full = serde_json::to_string(&downloading_state()).unwrap();
        std::fs::write(store.path(), &full[..full.len() / 2]).unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.phase, Phase::Idle);
        assert!(loaded.manifest.is_none());
        assert_eq!(loaded.last_error, Some(ErrorKind::StorageCorruption));
        assert!(dir.path().join("update-state.json.corrupt").exists());
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn test_downloading_without_manifest_resets_to_idle() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        std::fs::write(store.path(), br#"{"phase":"downloading","bytes_downloaded":0}"#).unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.phase, Phase::Idle);
        assert!(loaded.manifest.is_none());
        assert_eq!(loaded.last_error, Some(ErrorKind::StorageCorruption));
    }

    #[tokio::test]
    async fn test_read_does_not_recover() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        std::fs::write(store.path(), b"garbage").unwrap();
        assert!(store.read().await.is_err());
        assert!(store.path().exists());
    }
}
