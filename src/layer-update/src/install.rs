//! Installation boundary.

use async_trait::async_trait;
use tracing::{info, warn};

use crate::command::run_command;
use crate::config::{CommandSpec, InstallerConfig};
use crate::verify::VerifiedPayload;

/// Result of a successful installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub diagnostic: String,
}

/// Installation was rejected or could not run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("installation failed: {diagnostic}")]
pub struct InstallFailure {
    pub diagnostic: String,
}

impl InstallFailure {
    pub fn new(diagnostic: impl Into<String>) -> Self {
        Self {
            diagnostic: diagnostic.into(),
        }
    }
}

/// Applies a verified payload to the system.
///
/// The orchestrator calls `install` at most once per payload and never
/// retries it automatically.
#[async_trait]
pub trait Installer: Send + Sync {
    async fn install(&self, payload: &VerifiedPayload) -> Result<InstallReport, InstallFailure>;
}

/// Installs by running a configured command, then any post-install commands.
#[derive(Debug, Clone)]
pub struct CommandInstaller {
    install: CommandSpec,
    post_install: Vec<CommandSpec>,
}

impl CommandInstaller {
    pub fn new(install: CommandSpec, post_install: Vec<CommandSpec>) -> Self {
        Self {
            install,
            post_install,
        }
    }

    /// Build from configuration, running every command through its wrapper.
    pub fn from_config(config: &InstallerConfig) -> Self {
        Self::new(
            config.command.wrapped(&config.wrapper),
            config
                .post_install
                .iter()
                .map(|command| command.wrapped(&config.wrapper))
                .collect(),
        )
    }
}

/// Run the configured startup commands once.
///
/// Failures are logged and never stop the agent. Returns how many commands
/// exited successfully.
pub async fn run_startup_commands(config: &InstallerConfig) -> usize {
    let mut succeeded = 0;
    for command in &config.startup {
        let command = command.wrapped(&config.wrapper);
        match run_command(&command, &[]).await {
            Ok(output) if output.success() => {
                info!(program = %command.program, args = ?command.args, "Startup command finished");
                succeeded += 1;
            }
            Ok(output) => {
                warn!(program = %command.program, diagnostic = %output.diagnostic(), "Startup command failed");
            }
            Err(e) => {
                warn!(program = %command.program, error = %e, "Startup command could not run");
            }
        }
    }
    succeeded
}

#[async_trait]
impl Installer for CommandInstaller {
    async fn install(&self, payload: &VerifiedPayload) -> Result<InstallReport, InstallFailure> {
        let path = payload.path().to_string_lossy();
        let version = payload.manifest().version.to_string();
        let vars = [("payload", path.as_ref()), ("version", version.as_str())];

        let output = run_command(&self.install, &vars)
            .await
            .map_err(|e| InstallFailure::new(format!("failed to run {}: {}", self.install.program, e)))?;
        if !output.success() {
            return Err(InstallFailure::new(output.diagnostic()));
        }
        info!(version = %version, "Package installed");

        for command in &self.post_install {
            match run_command(command, &vars).await {
                Ok(output) if output.success() => {}
                Ok(output) => {
                    warn!(program = %command.program, diagnostic = %output.diagnostic(), "Post-install command failed");
                }
                Err(e) => {
                    warn!(program = %command.program, error = %e, "Post-install command could not run");
                }
            }
        }

        Ok(InstallReport {
            diagnostic: output.diagnostic(),
        })
    }
}
