//! Agent configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::DEFAULT_MANIFEST_URL;
use crate::backoff::RetryPolicy;
use crate::error::{UpdateError, UpdateResult};

/// Package the agent keeps up to date.
const DEFAULT_TARGET_PACKAGE: &str = "com.layer.layer_android_display.staging";

/// Top-level agent configuration, loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Manifest endpoint
    #[serde(default = "default_manifest_url")]
    pub manifest_url: String,

    /// Directory holding the state record and staging payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,

    /// Seconds between periodic update checks (default: 600)
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub retry: RetryPolicy,

    /// How to find the currently installed version
    #[serde(default)]
    pub installed_version: VersionSource,

    #[serde(default)]
    pub installer: InstallerConfig,
}

fn default_manifest_url() -> String {
    DEFAULT_MANIFEST_URL.to_string()
}

fn default_check_interval_secs() -> u64 {
    600
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            manifest_url: default_manifest_url(),
            state_dir: None,
            check_interval_secs: default_check_interval_secs(),
            network: NetworkConfig::default(),
            retry: RetryPolicy::default(),
            installed_version: VersionSource::default(),
            installer: InstallerConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> UpdateResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| UpdateError::ConfigError {
            message: format!("failed to read {}: {}", path.display(), e),
        })?;
        toml::from_str(&content).map_err(|e| UpdateError::ConfigError {
            message: format!("failed to parse {}: {}", path.display(), e),
        })
    }

    /// Apply `LAYER_UPDATER_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> UpdateResult<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides using `lookup` to read variables.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> UpdateResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("LAYER_UPDATER_MANIFEST_URL") {
            self.manifest_url = url;
        }

        if let Some(dir) = lookup("LAYER_UPDATER_STATE_DIR") {
            self.state_dir = Some(PathBuf::from(dir));
        }

        if let Some(secs) = lookup("LAYER_UPDATER_CHECK_INTERVAL_SECS") {
            self.check_interval_secs = secs.parse().map_err(|_| UpdateError::ConfigError {
                message: format!("LAYER_UPDATER_CHECK_INTERVAL_SECS is not a number: {}", secs),
            })?;
        }

        Ok(())
    }

    /// Reject configurations the agent cannot run with.
    pub fn validate(&self) -> UpdateResult<()> {
        url::Url::parse(&self.manifest_url).map_err(|e| UpdateError::ConfigError {
            message: format!("invalid manifest_url {}: {}", self.manifest_url, e),
        })?;
        if self.check_interval_secs == 0 {
            return Err(UpdateError::ConfigError {
                message: "check_interval_secs must be greater than zero".to_string(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(UpdateError::ConfigError {
                message: "retry.max_attempts must be at least 1".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(UpdateError::ConfigError {
                message: format!("retry.jitter must be within 0.0..=1.0, got {}", self.retry.jitter),
            });
        }
        if self.network.checkpoint_interval_bytes == 0 {
            return Err(UpdateError::ConfigError {
                message: "network.checkpoint_interval_bytes must be greater than zero".to_string(),
            });
        }
        if self.installer.command.program.trim().is_empty() {
            return Err(UpdateError::ConfigError {
                message: "installer.command.program must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Directory for the state record and staging files.
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("layer-updater")
        })
    }

    /// Location of the in-progress payload.
    pub fn staging_path(&self) -> PathBuf {
        self.state_dir().join("staging").join("payload.bin")
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

/// Timeouts and checkpoint granularity for network operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Timeout for the whole manifest request
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Timeout for each payload chunk read
    #[serde(default = "default_chunk_timeout_secs")]
    pub chunk_timeout_secs: u64,

    /// Bytes written between persisted download checkpoints
    #[serde(default = "default_checkpoint_interval_bytes")]
    pub checkpoint_interval_bytes: u64,
}

fn default_connect_timeout_secs() -> u64 {
    3
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_chunk_timeout_secs() -> u64 {
    30
}

fn default_checkpoint_interval_bytes() -> u64 {
    256 * 1024
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            chunk_timeout_secs: default_chunk_timeout_secs(),
            checkpoint_interval_bytes: default_checkpoint_interval_bytes(),
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }
}

/// A program and its argument template.
///
/// Arguments may contain `{name}` placeholders filled in at run time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Arguments with every `{name}` placeholder substituted.
    pub fn render_args(&self, vars: &[(&str, &str)]) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                vars.iter().fold(arg.clone(), |acc, (name, value)| {
                    acc.replace(&format!("{{{}}}", name), value)
                })
            })
            .collect()
    }

    /// This command run through `wrapper`, e.g. `su root pm install ...`.
    pub fn wrapped(&self, wrapper: &[String]) -> Self {
        let Some((program, prefix)) = wrapper.split_first() else {
            return self.clone();
        };
        let args = prefix
            .iter()
            .cloned()
            .chain(std::iter::once(self.program.clone()))
            .chain(self.args.iter().cloned())
            .collect();
        Self {
            program: program.clone(),
            args,
        }
    }
}

/// Platform installation commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallerConfig {
    /// Installs the payload; `{payload}` and `{version}` are substituted
    #[serde(default = "default_install_command")]
    pub command: CommandSpec,

    /// Run after a successful install to restart the target app
    #[serde(default = "default_post_install")]
    pub post_install: Vec<CommandSpec>,

    /// Run once when the agent starts
    #[serde(default = "default_startup_commands")]
    pub startup: Vec<CommandSpec>,

    /// Prefix for every installer command; empty runs commands directly
    #[serde(default = "default_root_wrapper")]
    pub wrapper: Vec<String>,
}

fn default_install_command() -> CommandSpec {
    CommandSpec::new("pm", ["install", "-r", "{payload}"])
}

fn default_post_install() -> Vec<CommandSpec> {
    vec![
        CommandSpec::new("am", ["force-stop", DEFAULT_TARGET_PACKAGE]),
        CommandSpec::new(
            "monkey",
            [
                "-p",
                DEFAULT_TARGET_PACKAGE,
                "-c",
                "android.intent.category.LAUNCHER",
                "1",
            ],
        ),
    ]
}

fn default_startup_commands() -> Vec<CommandSpec> {
    vec![CommandSpec::new(
        "pm",
        ["disable-user", "--user", "0", "com.google.android.gms"],
    )]
}

fn default_root_wrapper() -> Vec<String> {
    vec!["su".to_string(), "root".to_string()]
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            command: default_install_command(),
            post_install: default_post_install(),
            startup: default_startup_commands(),
            wrapper: default_root_wrapper(),
        }
    }
}

/// Where the installed version of the target package comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VersionSource {
    /// A fixed version; `None` means the package is not installed
    Fixed { version: Option<String> },
    /// A file whose trimmed content is the version
    File { path: PathBuf },
    /// A command whose output contains the version, optionally after `prefix`
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        prefix: Option<String>,
    },
}

impl Default for VersionSource {
    fn default() -> Self {
        Self::Command {
            program: "dumpsys".to_string(),
            args: vec!["package".to_string(), DEFAULT_TARGET_PACKAGE.to_string()],
            prefix: Some("versionCode=".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.check_interval(), Duration::from_secs(600));
        assert_eq!(config.network.connect_timeout(), Duration::from_secs(3));
        assert_eq!(config.installer.command.program, "pm");
        assert_eq!(config.installer.wrapper, vec!["su", "root"]);
        assert_eq!(
            config.installer.post_install,
            vec![
                CommandSpec::new("am", ["force-stop", DEFAULT_TARGET_PACKAGE]),
                CommandSpec::new(
                    "monkey",
                    ["-p", DEFAULT_TARGET_PACKAGE, "-c", "android.intent.category.LAUNCHER", "1"]
                ),
            ]
        );
        assert_eq!(
            config.installer.startup[0].args,
            vec!["disable-user", "--user", "0", "com.google.android.gms"]
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_toml() {
        let config: AgentConfig = toml::from_str(
            r#"
            manifest_url = "https://updates.example.com/manifest.json"
            state_dir = "/data/layer-updater"
            check_interval_secs = 120

            [network]
            chunk_timeout_secs = 5

            [retry]
            max_attempts = 3

            [installed_version]
            type = "command"
            program = "dumpsys"
            args = ["package", "com.example.app"]
            prefix = "versionCode="

            [installer]
            command = { program = "pm", args = ["install", "-r", "{payload}"] }
            post_install = [
                { program = "am", args = ["force-stop", "com.example.app"] },
            ]
            startup = []
            wrapper = []
            "#,
        )
        .unwrap();

        assert_eq!(config.check_interval_secs, 120);
        assert_eq!(config.network.chunk_timeout_secs, 5);
        assert_eq!(config.network.connect_timeout_secs, 3);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay_secs, 30);
        assert_eq!(config.installer.post_install.len(), 1);
        assert!(config.installer.startup.is_empty());
        assert!(config.installer.wrapper.is_empty());
        assert_eq!(
            config.staging_path(),
            PathBuf::from("/data/layer-updater/staging/payload.bin")
        );
        assert!(matches!(
            config.installed_version,
            VersionSource::Command { prefix: Some(ref p), .. } if p == "versionCode="
        ));
    }

    #[test]
    fn test_fixed_version_source() {
        let source: VersionSource = toml::from_str(
            r#"
            type = "fixed"
            version = "4"
            "#,
        )
        .unwrap();
        assert_eq!(
            source,
            VersionSource::Fixed {
                version: Some("4".to_string())
            }
        );
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("LAYER_UPDATER_MANIFEST_URL", "https://mirror.example.com/m.json"),
            ("LAYER_UPDATER_CHECK_INTERVAL_SECS", "30"),
        ]
        .into_iter()
        .collect();

        let mut config = AgentConfig::default();
        config
            .apply_env_from(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.manifest_url, "https://mirror.example.com/m.json");
        assert_eq!(config.check_interval_secs, 30);

        let err = config
            .apply_env_from(|key| {
                (key == "LAYER_UPDATER_CHECK_INTERVAL_SECS").then(|| "soon".to_string())
            })
            .unwrap_err();
        assert!(matches!(err, UpdateError::ConfigError { .. }));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AgentConfig::default();
        config.manifest_url = "not a url".to_string();
        assert!(config.validate().is_err());

        let mut config = AgentConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_jitter() {
        let config: AgentConfig = toml::from_str("[retry]\njitter = nan\n").unwrap();
        assert!(config.retry.jitter.is_nan());
        assert!(matches!(
            config.validate(),
            Err(UpdateError::ConfigError { .. })
        ));

        for jitter in [-0.1, 1.5, f64::INFINITY] {
            let mut config = AgentConfig::default();
            config.retry.jitter = jitter;
            assert!(config.validate().is_err(), "jitter: {}", jitter);
        }

        let mut config = AgentConfig::default();
        config.retry.jitter = 1.0;
        config.validate().unwrap();
    }

    #[test]
    fn test_render_args() {
        let spec = CommandSpec::new("pm", ["install", "-r", "{payload}", "--tag={version}"]);
        assert_eq!(
            spec.render_args(&[("payload", "/tmp/app.apk"), ("version", "5")]),
            vec!["install", "-r", "/tmp/app.apk", "--tag=5"]
        );
    }

    #[test]
    fn test_wrapped_command() {
        let spec = CommandSpec::new("pm", ["install", "-r", "{payload}"]);
        let wrapped = spec.wrapped(&["su".to_string(), "root".to_string()]);
        assert_eq!(wrapped.program, "su");
        assert_eq!(wrapped.args, vec!["root", "pm", "install", "-r", "{payload}"]);
        assert_eq!(spec.wrapped(&[]), spec);
    }
}
