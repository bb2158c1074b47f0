// ABOUTME: Configuration management for claude-squad
// Handles the application config file, session type selection, and resolution
// of the agent binary through the user's shell profile.

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

pub mod filelock;
pub mod state;

pub use filelock::FileLock;
pub use state::State;

pub const CONFIG_FILE_NAME: &str = "config.json";

const DEFAULT_PROGRAM: &str = "claude";

/// Returns the path to the application's configuration directory.
pub fn get_config_dir() -> Result<PathBuf> {
    let home_dir = dirs::home_dir().context("failed to get home directory")?;
    Ok(home_dir.join(".claude-squad"))
}

/// The type of backend session an instance runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SessionType {
    /// Local zellij multiplexer session.
    #[default]
    #[serde(rename = "zellij")]
    Zellij,
    /// Docker container with the worktree bind-mounted at /workspace.
    #[serde(rename = "docker-bind")]
    DockerBind,
    /// Docker container that clones the repository internally.
    #[serde(rename = "docker-clone")]
    DockerClone,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::Zellij => "zellij",
            SessionType::DockerBind => "docker-bind",
            SessionType::DockerClone => "docker-clone",
        }
    }

    /// True for both Docker-backed session types.
    pub fn is_docker(&self) -> bool {
        matches!(self, SessionType::DockerBind | SessionType::DockerClone)
    }
}

impl std::fmt::Display for SessionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strategy used to produce instance summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SummaryMode {
    /// Pure regex extraction from captured pane content.
    #[default]
    #[serde(rename = "regex")]
    Regex,
    /// Delegate to the agent's non-interactive completion mode.
    #[serde(rename = "claude")]
    Claude,
}

/// Application configuration persisted at `<config_dir>/config.json`.
///
/// Unknown keys in the file are tolerated so configs written by newer
/// versions still load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Default program to run in new instances.
    #[serde(default = "default_program")]
    pub default_program: String,

    /// Automatically accept agent prompts by tapping enter.
    #[serde(default)]
    pub auto_yes: bool,

    /// Interval (ms) at which the daemon polls sessions in auto-yes mode.
    #[serde(default = "default_poll_interval")]
    pub daemon_poll_interval: u64,

    /// Prefix used for git branches created by the application.
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,

    /// Default session type for new instances.
    #[serde(default)]
    pub default_session_type: SessionType,

    /// Base Docker image for Docker sessions.
    #[serde(default = "default_docker_image")]
    pub docker_base_image: String,

    /// How instance summaries are generated.
    #[serde(default)]
    pub summary_mode: SummaryMode,
}

fn default_program() -> String {
    DEFAULT_PROGRAM.to_string()
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_branch_prefix() -> String {
    let username = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default();
    if username.is_empty() {
        return "session/".to_string();
    }
    format!("{}/", username.to_lowercase())
}

fn default_docker_image() -> String {
    "ubuntu:24.04".to_string()
}

impl Default for Config {
    fn default() -> Self {
        let program = get_claude_command().unwrap_or_else(|e| {
            warn!("failed to resolve claude command: {e}");
            DEFAULT_PROGRAM.to_string()
        });

        Self {
            default_program: program,
            auto_yes: false,
            daemon_poll_interval: default_poll_interval(),
            branch_prefix: default_branch_prefix(),
            default_session_type: SessionType::default(),
            docker_base_image: default_docker_image(),
            summary_mode: SummaryMode::default(),
        }
    }
}

impl Config {
    /// Load the configuration from the default config directory.
    ///
    /// A missing file yields defaults which are written back. An unparseable
    /// file is backed up with a timestamp suffix and defaults are returned.
    pub fn load() -> Self {
        match get_config_dir() {
            Ok(dir) => Self::load_from_dir(&dir),
            Err(e) => {
                warn!("failed to get config directory: {e}");
                Self::default()
            }
        }
    }

    /// Load the configuration from an explicit directory.
    pub fn load_from_dir(config_dir: &Path) -> Self {
        let config_path = config_dir.join(CONFIG_FILE_NAME);

        let data = match fs::read(&config_path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let default = Self::default();
                if let Err(e) = default.save_to_dir(config_dir) {
                    warn!("failed to save default config: {e}");
                }
                return default;
            }
            Err(e) => {
                warn!("failed to read config file: {e}");
                return Self::default();
            }
        };

        match serde_json::from_slice(&data) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "failed to parse config file at {}: {e}",
                    config_path.display()
                );

                // Keep the corrupted file around so the user can recover it.
                let backup_path = format!(
                    "{}.corrupt.{}",
                    config_path.display(),
                    chrono::Utc::now().format("%Y%m%d-%H%M%S")
                );
                if fs::write(&backup_path, &data).is_ok() {
                    info!("backed up corrupted config to {backup_path}");
                }

                Self::default()
            }
        }
    }

    /// Save the configuration to the default config directory.
    pub fn save(&self) -> Result<()> {
        self.save_to_dir(&get_config_dir()?)
    }

    /// Save the configuration to an explicit directory.
    pub fn save_to_dir(&self, config_dir: &Path) -> Result<()> {
        fs::create_dir_all(config_dir).with_context(|| {
            format!("failed to create config directory {}", config_dir.display())
        })?;

        let config_path = config_dir.join(CONFIG_FILE_NAME);
        let data = serde_json::to_vec_pretty(self).context("failed to marshal config")?;
        fs::write(&config_path, data)
            .with_context(|| format!("failed to write config to {}", config_path.display()))
    }
}

lazy_static! {
    // Matches alias definitions like "claude: aliased to /path/to/claude",
    // "claude -> /path" or "claude=/path".
    static ref ALIAS_RE: Regex = Regex::new(r"(?:aliased to|->|=)\s*(\S+)").unwrap();
}

/// Attempts to find the `claude` command through the user's shell.
///
/// Sources the shell profile first so aliases and PATH extensions defined
/// there are visible, then falls back to a plain PATH lookup.
pub fn get_claude_command() -> Result<String> {
    let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string());

    let shell_cmd = if shell.contains("zsh") {
        "source ~/.zshrc &>/dev/null || true; which claude"
    } else if shell.contains("bash") {
        "source ~/.bashrc &>/dev/null || true; which claude"
    } else {
        "which claude"
    };

    if let Ok(output) = Command::new(&shell).args(["-c", shell_cmd]).output() {
        if output.status.success() {
            let mut path = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !path.is_empty() {
                // Unwrap shell alias definitions to the underlying binary path.
                if let Some(captures) = ALIAS_RE.captures(&path) {
                    path = captures[1].to_string();
                }
                return Ok(path);
            }
        }
    }

    // Plain PATH lookup as a last resort.
    let output = Command::new("which")
        .arg("claude")
        .output()
        .context("failed to run which")?;
    if output.status.success() {
        let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !path.is_empty() {
            return Ok(path);
        }
    }

    anyhow::bail!("claude command not found in aliases or PATH")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_config_writes_defaults_back() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_from_dir(dir.path());

        assert!(dir.path().join(CONFIG_FILE_NAME).exists());
        assert_eq!(config.daemon_poll_interval, 1000);
        assert_eq!(config.default_session_type, SessionType::Zellij);
        assert!(!config.auto_yes);
    }

    #[test]
    fn test_config_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::load_from_dir(dir.path());
        config.branch_prefix = "squad/".to_string();
        config.default_session_type = SessionType::DockerBind;
        config.summary_mode = SummaryMode::Claude;
        config.save_to_dir(dir.path()).unwrap();

        let loaded = Config::load_from_dir(dir.path());
        assert_eq!(loaded.branch_prefix, "squad/");
        assert_eq!(loaded.default_session_type, SessionType::DockerBind);
        assert_eq!(loaded.summary_mode, SummaryMode::Claude);
    }

    #[test]
    fn test_corrupt_config_is_backed_up() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "{not json").unwrap();

        let config = Config::load_from_dir(dir.path());
        assert_eq!(config.daemon_poll_interval, 1000);

        let backups: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".corrupt."))
            .collect();
        assert_eq!(backups.len(), 1);
    }

    #[test]
    fn test_unknown_keys_are_tolerated() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            r#"{"default_program": "aider", "some_future_key": 42}"#,
        )
        .unwrap();

        let config = Config::load_from_dir(dir.path());
        assert_eq!(config.default_program, "aider");
    }

    #[test]
    fn test_session_type_serialization() {
        assert_eq!(
            serde_json::to_string(&SessionType::DockerClone).unwrap(),
            "\"docker-clone\""
        );
        let parsed: SessionType = serde_json::from_str("\"zellij\"").unwrap();
        assert_eq!(parsed, SessionType::Zellij);
    }

    #[test]
    fn test_branch_prefix_defaults_to_lowercased_username() {
        let prefix = default_branch_prefix();
        assert!(prefix.ends_with('/'));
        assert_eq!(prefix, prefix.to_lowercase());
    }
}
