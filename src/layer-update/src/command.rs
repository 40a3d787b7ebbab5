//! External command execution for platform collaborators.

use tokio::process::Command;
use tracing::debug;

use crate::config::CommandSpec;
use crate::error::UpdateResult;

/// Maximum bytes of stdout/stderr kept in diagnostics.
const MAX_OUTPUT_BYTES: usize = 2048;

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code, `None` when terminated by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// One-line summary suitable for logs and persisted diagnostics.
    pub fn diagnostic(&self) -> String {
        let code = self
            .code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        format!(
            "exit code {}; stdout: {}; stderr: {}",
            code,
            truncate(self.stdout.trim()),
            truncate(self.stderr.trim())
        )
    }
}

fn truncate(text: &str) -> &str {
    if text.len() <= MAX_OUTPUT_BYTES {
        return text;
    }
    let mut end = MAX_OUTPUT_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Run a command to completion, substituting `{name}` placeholders in its
/// arguments from `vars`.
pub async fn run_command(spec: &CommandSpec, vars: &[(&str, &str)]) -> UpdateResult<CommandOutput> {
    let args = spec.render_args(vars);
    debug!(program = %spec.program, args = ?args, "Running command");

    let output = Command::new(&spec.program).args(&args).output().await?;

    Ok(CommandOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
