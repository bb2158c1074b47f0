// ABOUTME: Docker container sessions using Bollard for container lifecycle
//
// Two modes share this backend: bind-mount (the worktree is mounted at
// /workspace) and clone (the repository is cloned inside the container).
// Container management goes through the Docker API; the interactive agent
// process runs under a local PTY spawning `docker exec -it`, which the API
// cannot provide.

use anyhow::{Context, Result};
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::StreamExt;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

use portable_pty::CommandBuilder;

use crate::config::SessionType;
use crate::zellij::{ContentCache, PtyHandle, StatusMonitor, TerminalBuffer, CONTENT_CACHE_TTL};

/// Containers carry the same product prefix as zellij sessions.
pub const DOCKER_PREFIX: &str = "claudesquad_";

const CONTAINER_WORK_DIR: &str = "/workspace";
const CLAUDE_CONFIG_MOUNT: &str = "/root/.claude";

lazy_static! {
    static ref WHITESPACE_RE: Regex = Regex::new(r"\s+").unwrap();
}

/// Maps a title to a container name, with a clock suffix so repeated
/// lifetimes of the same title never collide.
fn to_docker_container_name(name: &str) -> String {
    let cleaned = WHITESPACE_RE.replace_all(name, "").replace('.', "_");
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
        & 0xFFFF;
    format!("{DOCKER_PREFIX}{cleaned}_{suffix:x}")
}

/// Options for creating a Docker session.
#[derive(Debug, Clone, Default)]
pub struct DockerOptions {
    pub base_image: String,
    pub repo_url: String,
    pub branch_name: String,
    pub work_dir: String,
}

/// A managed Docker container session.
pub struct DockerSession {
    container_name: String,
    base_image: String,
    program: String,
    session_type: SessionType,

    // Git info for clone mode
    repo_url: String,
    branch_name: String,

    // Host paths
    host_work_dir: String,
    host_claude_dir: String,

    term_buffer: Arc<TerminalBuffer>,
    content_cache: Arc<ContentCache>,
    monitor: StatusMonitor,
    pty: Option<PtyHandle>,
}

impl std::fmt::Debug for DockerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerSession")
            .field("container_name", &self.container_name)
            .field("base_image", &self.base_image)
            .field("program", &self.program)
            .field("session_type", &self.session_type)
            .field("pty", &self.pty.is_some())
            .finish()
    }
}

impl DockerSession {
    pub fn new(name: &str, program: &str, session_type: SessionType, opts: DockerOptions) -> Self {
        let claude_dir = dirs::home_dir()
            .map(|home| home.join(".claude").to_string_lossy().into_owned())
            .unwrap_or_else(|| "/root/.claude".to_string());

        let container_name = if name.starts_with(DOCKER_PREFIX) {
            name.to_string()
        } else {
            to_docker_container_name(name)
        };

        Self {
            container_name,
            base_image: opts.base_image,
            program: program.to_string(),
            session_type,
            repo_url: opts.repo_url,
            branch_name: opts.branch_name,
            host_work_dir: opts.work_dir,
            host_claude_dir: claude_dir,
            term_buffer: Arc::new(TerminalBuffer::new()),
            content_cache: Arc::new(ContentCache::new(CONTENT_CACHE_TTL)),
            monitor: StatusMonitor::new(),
            pty: None,
        }
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    pub fn get_program(&self) -> &str {
        &self.program
    }

    fn docker(&self) -> Result<Docker> {
        Docker::connect_with_local_defaults().context("failed to connect to Docker daemon")
    }

    /// Creates and starts a new container session.
    pub async fn start(&mut self, work_dir: &Path) -> Result<()> {
        self.host_work_dir = work_dir.to_string_lossy().into_owned();

        if self.does_session_exist().await {
            anyhow::bail!("docker container already exists: {}", self.container_name);
        }

        let docker = self.docker()?;

        // Mount ~/.claude so agent auth and config persist across containers.
        let mut binds = vec![format!("{}:{}", self.host_claude_dir, CLAUDE_CONFIG_MOUNT)];
        let mut working_dir = None;
        if self.session_type == SessionType::DockerBind {
            binds.push(format!("{}:{}", self.host_work_dir, CONTAINER_WORK_DIR));
            working_dir = Some(CONTAINER_WORK_DIR.to_string());
        }

        info!(
            "creating docker container {} from image {}",
            self.container_name, self.base_image
        );

        let config = Config::<String> {
            image: Some(self.base_image.clone()),
            // Keep the container alive; the agent runs via exec sessions.
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            working_dir,
            host_config: Some(HostConfig {
                binds: Some(binds),
                ..Default::default()
            }),
            ..Default::default()
        };

        docker
            .create_container(
                Some(CreateContainerOptions {
                    name: self.container_name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .context("failed to create docker container")?;

        docker
            .start_container(
                &self.container_name,
                None::<StartContainerOptions<String>>,
            )
            .await
            .context("failed to start docker container")?;

        if self.session_type == SessionType::DockerClone && !self.repo_url.is_empty() {
            if let Err(e) = self.clone_repo_in_container(&docker).await {
                let _ = self.close().await;
                return Err(e.context("failed to clone repo in container"));
            }
        }

        self.restore().await
    }

    /// Clones the repository inside the container and checks out the branch.
    async fn clone_repo_in_container(&self, docker: &Docker) -> Result<()> {
        let (code, output) = self
            .exec_capture(
                docker,
                vec!["git", "clone", &self.repo_url, CONTAINER_WORK_DIR],
                None,
            )
            .await?;
        if code != 0 {
            anyhow::bail!("git clone failed: {output}");
        }

        if !self.branch_name.is_empty() {
            let (code, create_output) = self
                .exec_capture(
                    docker,
                    vec!["git", "checkout", "-b", &self.branch_name],
                    Some(CONTAINER_WORK_DIR),
                )
                .await?;
            if code != 0 {
                // The branch may already exist; fall back to a plain checkout.
                let (code, checkout_output) = self
                    .exec_capture(
                        docker,
                        vec!["git", "checkout", &self.branch_name],
                        Some(CONTAINER_WORK_DIR),
                    )
                    .await?;
                if code != 0 {
                    anyhow::bail!("git checkout failed: {create_output} {checkout_output}");
                }
            }
        }

        Ok(())
    }

    /// Runs a command inside the container, returning its exit code and
    /// combined output.
    async fn exec_capture(
        &self,
        docker: &Docker,
        cmd: Vec<&str>,
        working_dir: Option<&str>,
    ) -> Result<(i64, String)> {
        let exec = docker
            .create_exec(
                &self.container_name,
                CreateExecOptions {
                    cmd: Some(cmd.iter().map(|s| s.to_string()).collect()),
                    working_dir: working_dir.map(str::to_string),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .context("failed to create exec")?;

        let mut collected = String::new();
        if let StartExecResults::Attached { mut output, .. } = docker
            .start_exec(&exec.id, None)
            .await
            .context("failed to start exec")?
        {
            while let Some(chunk) = output.next().await {
                if let Ok(log) = chunk {
                    collected.push_str(&log.to_string());
                }
            }
        }

        let inspect = docker
            .inspect_exec(&exec.id)
            .await
            .context("failed to inspect exec")?;
        Ok((inspect.exit_code.unwrap_or(-1), collected))
    }

    /// Starts the container if needed and opens a fresh exec PTY running the
    /// agent program.
    pub async fn restore(&mut self) -> Result<()> {
        if !self.is_container_running().await {
            let docker = self.docker()?;
            docker
                .start_container(
                    &self.container_name,
                    None::<StartContainerOptions<String>>,
                )
                .await
                .context("failed to start container")?;
        }

        self.start_exec_session()
    }

    /// Spawns `docker exec -it` under a PTY running the program. Inside a
    /// container the agent gets `--dangerously-skip-permissions`, since the
    /// container is the sandbox.
    fn start_exec_session(&mut self) -> Result<()> {
        let mut program_cmd = self.program.clone();
        if self.program.contains("claude")
            && !self.program.contains("--dangerously-skip-permissions")
        {
            program_cmd.push_str(" --dangerously-skip-permissions");
        }

        if let Some(pty) = self.pty.take() {
            pty.shutdown();
        }
        self.term_buffer.reset();

        let mut cmd = CommandBuilder::new("docker");
        cmd.args(["exec", "-it"]);
        if self.session_type == SessionType::DockerClone {
            cmd.args(["-w", CONTAINER_WORK_DIR]);
        }
        cmd.arg(&self.container_name);
        cmd.args(["sh", "-c"]);
        cmd.arg(&program_cmd);

        let pty = PtyHandle::open(cmd, &self.term_buffer)?;
        self.pty = Some(pty);
        Ok(())
    }

    async fn is_container_running(&self) -> bool {
        let Ok(docker) = self.docker() else {
            return false;
        };
        docker
            .inspect_container(&self.container_name, None)
            .await
            .ok()
            .and_then(|info| info.state)
            .and_then(|state| state.running)
            .unwrap_or(false)
    }

    /// Disconnects the PTY and stops the container, preserving its
    /// filesystem.
    pub async fn detach_safely(&mut self) -> Result<()> {
        if let Some(pty) = self.pty.take() {
            pty.shutdown();
        }

        let docker = self.docker()?;
        if let Err(e) = docker
            .stop_container(&self.container_name, Some(StopContainerOptions { t: 10 }))
            .await
        {
            warn!("failed to stop container {}: {e}", self.container_name);
        }
        Ok(())
    }

    /// Panicking variant of `detach_safely`, mirroring the local backend's
    /// interactive detach contract.
    pub async fn detach(&mut self) {
        if let Err(e) = self.detach_safely().await {
            panic!("detach failed: {e}");
        }
    }

    /// Terminates the session and removes the container.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(pty) = self.pty.take() {
            pty.shutdown();
        }

        let docker = self.docker()?;
        docker
            .remove_container(
                &self.container_name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .context("failed to remove container")?;
        Ok(())
    }

    /// Sends keystrokes to the exec PTY.
    pub fn send_keys(&self, keys: &str) -> Result<()> {
        let pty = self
            .pty
            .as_ref()
            .context("not attached to container")?;
        let mut writer = pty.writer.lock().unwrap_or_else(|e| e.into_inner());
        writer.write_all(keys.as_bytes())?;
        writer.flush()?;
        self.content_cache.invalidate();
        Ok(())
    }

    pub fn tap_enter(&self) -> Result<()> {
        self.send_keys("\n")
    }

    pub fn tap_d_and_enter(&self) -> Result<()> {
        self.send_keys("D\n")
    }

    /// Captures the current visible content. Containers have no dump-screen
    /// equivalent, so this is always the live screen buffer rendering.
    pub fn capture_pane_content(&self) -> Result<String> {
        if let Some(content) = self.content_cache.get() {
            return Ok(content);
        }
        let content = self.term_buffer.render();
        self.content_cache.set(content.clone());
        Ok(content)
    }

    /// Checks whether the screen changed since the last call, and whether a
    /// confirmation prompt is displayed.
    pub fn has_updated(&mut self) -> (bool, bool) {
        let content = self.term_buffer.render();
        let updated = self.monitor.has_changed(&content);
        (updated, check_for_prompt(&content))
    }

    /// True if the container exists (running or stopped).
    pub async fn does_session_exist(&self) -> bool {
        let Ok(docker) = self.docker() else {
            return false;
        };
        docker
            .inspect_container(&self.container_name, None)
            .await
            .is_ok()
    }

    pub fn set_detached_size(&self, width: u16, height: u16) -> Result<()> {
        self.term_buffer.resize(height, width);
        if let Some(pty) = &self.pty {
            pty.resize(height, width)?;
        }
        Ok(())
    }

    /// True if the agent process is alive inside the container.
    pub async fn is_program_running(&self) -> Result<bool> {
        if !self.is_container_running().await {
            return Ok(false);
        }

        let docker = self.docker()?;
        let (code, _) = self
            .exec_capture(&docker, vec!["pgrep", "-f", "claude"], None)
            .await?;
        Ok(code == 0)
    }

    /// Restarts the agent by opening a fresh exec session. The arguments are
    /// ignored; conversation resume state lives in the mounted config.
    pub async fn restart_program(&mut self, _args: &str) -> Result<()> {
        if !self.is_container_running().await {
            let docker = self.docker()?;
            docker
                .start_container(
                    &self.container_name,
                    None::<StartContainerOptions<String>>,
                )
                .await
                .context("failed to start container")?;
        }
        self.start_exec_session()
    }
}

/// Prompt indicators shown by agents running inside a container.
fn check_for_prompt(content: &str) -> bool {
    const PROMPT_INDICATORS: &[&str] = &[
        "Do you trust the files",
        "No, and tell Claude what to do differently",
        "[Y/n]",
        "[y/N]",
        "(yes/no)",
    ];
    PROMPT_INDICATORS
        .iter()
        .any(|indicator| content.contains(indicator))
}

/// True if the Docker daemon is reachable.
pub async fn is_docker_available() -> bool {
    let Ok(docker) = Docker::connect_with_local_defaults() else {
        return false;
    };
    tokio::time::timeout(Duration::from_secs(3), docker.ping())
        .await
        .map(|result| result.is_ok())
        .unwrap_or(false)
}

/// Force-removes every container bearing the product prefix.
pub async fn cleanup_containers() -> Result<()> {
    let docker =
        Docker::connect_with_local_defaults().context("failed to connect to Docker daemon")?;

    let mut filters = HashMap::new();
    filters.insert("name".to_string(), vec![DOCKER_PREFIX.to_string()]);
    let containers = docker
        .list_containers(Some(ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        }))
        .await
        .context("failed to list containers")?;

    for container in containers {
        let Some(name) = container
            .names
            .as_ref()
            .and_then(|names| names.first())
            .map(|name| name.trim_start_matches('/').to_string())
        else {
            continue;
        };
        if !name.starts_with(DOCKER_PREFIX) {
            continue;
        }
        info!("cleaning up docker container: {name}");
        if let Err(e) = docker
            .remove_container(
                &name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            warn!("failed to remove container {name}: {e}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_name_carries_prefix_and_suffix() {
        let name = to_docker_container_name("my task.v2");
        assert!(name.starts_with("claudesquad_mytask_v2_"));

        let suffix = name.rsplit('_').next().unwrap();
        assert!(!suffix.is_empty() && suffix.len() <= 4);
        assert!(suffix.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn test_existing_prefix_is_not_doubled() {
        let session = DockerSession::new(
            "claudesquad_already",
            "claude",
            SessionType::DockerBind,
            DockerOptions::default(),
        );
        assert_eq!(session.container_name(), "claudesquad_already");
    }

    #[test]
    fn test_check_for_prompt() {
        assert!(check_for_prompt("Do you trust the files in this folder?"));
        assert!(check_for_prompt("Continue? [y/N]"));
        assert!(!check_for_prompt("compiling crate foo v0.1.0"));
    }
}
