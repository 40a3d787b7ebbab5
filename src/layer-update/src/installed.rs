//! Probes for the currently installed version of the target package.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::command::run_command;
use crate::config::{CommandSpec, VersionSource};
use crate::error::{UpdateError, UpdateResult};
use crate::version::Version;

/// Reports the installed version. `None` means the package is not
/// installed, so every published version counts as newer.
#[async_trait]
pub trait InstalledVersion: Send + Sync {
    async fn installed_version(&self) -> UpdateResult<Option<Version>>;
}

/// A version known up front.
#[derive(Debug, Clone)]
pub struct FixedVersion(pub Option<Version>);

#[async_trait]
impl InstalledVersion for FixedVersion {
    async fn installed_version(&self) -> UpdateResult<Option<Version>> {
        Ok(self.0.clone())
    }
}

/// Reads the version from a file written by the installed package.
#[derive(Debug, Clone)]
pub struct VersionFile {
    pub path: PathBuf,
}

#[async_trait]
impl InstalledVersion for VersionFile {
    async fn installed_version(&self) -> UpdateResult<Option<Version>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let text = content.trim();
        if text.is_empty() {
            return Ok(None);
        }
        Version::parse(text).map(Some).map_err(|_| UpdateError::VersionProbe {
            message: format!("{} does not contain a version: {}", self.path.display(), text),
        })
    }
}

/// Runs a command, e.g. a package manager query, and extracts the version
/// from its output.
#[derive(Debug, Clone)]
pub struct VersionCommand {
    pub command: CommandSpec,
    /// Text immediately preceding the version; the whole output when unset
    pub prefix: Option<String>,
}

#[async_trait]
impl InstalledVersion for VersionCommand {
    async fn installed_version(&self) -> UpdateResult<Option<Version>> {
        let output = run_command(&self.command, &[])
            .await
            .map_err(|e| UpdateError::VersionProbe {
                message: format!("failed to run {}: {}", self.command.program, e),
            })?;
        if !output.success() {
            debug!(diagnostic = %output.diagnostic(), "Version query failed, treating package as not installed");
            return Ok(None);
        }
        Ok(extract_version(&output.stdout, self.prefix.as_deref()))
    }
}

/// Find the first parseable version in `output`, after `prefix` if given.
fn extract_version(output: &str, prefix: Option<&str>) -> Option<Version> {
    match prefix {
        Some(prefix) => output.match_indices(prefix).find_map(|(index, _)| {
            let rest = &output[index + prefix.len()..];
            let token: String = rest
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-'))
                .collect();
            Version::parse(&token).ok()
        }),
        None => output
            .split_whitespace()
            .find_map(|token| Version::parse(token).ok()),
    }
}

/// Build the probe described by a configured [`VersionSource`].
pub fn from_source(source: &VersionSource) -> UpdateResult<Arc<dyn InstalledVersion>> {
    Ok(match source {
        VersionSource::Fixed { version } => {
            let version = version
                .as_deref()
                .map(Version::parse)
                .transpose()
                .map_err(|e| UpdateError::ConfigError {
                    message: format!("invalid installed_version: {}", e),
                })?;
            Arc::new(FixedVersion(version))
        }
        VersionSource::File { path } => Arc::new(VersionFile { path: path.clone() }),
        VersionSource::Command {
            program,
            args,
            prefix,
        } => Arc::new(VersionCommand {
            command: CommandSpec::new(program.clone(), args.clone()),
            prefix: prefix.clone(),
        }),
    })
}
