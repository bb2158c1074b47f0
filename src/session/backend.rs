// ABOUTME: Unified backend contract over zellij sessions and Docker containers
//
// Each instance owns exactly one backend handle. Operations dispatch over a
// tagged enum so the instance code stays backend-agnostic; the factory picks
// the variant from the configured session type.

use anyhow::Result;
use std::path::Path;
use tokio::sync::mpsc;

use crate::config::SessionType;
use crate::docker::{self, DockerOptions, DockerSession};
use crate::zellij::{self, ZellijSession};

/// Options for creating a backend session.
#[derive(Debug, Clone, Default)]
pub struct MultiplexerOptions {
    pub base_image: String,
    pub repo_url: String,
    pub branch_name: String,
    pub work_dir: String,
}

/// A backend session handle: one PTY, one screen buffer, and one OS-level
/// resource (named multiplexer session or container).
pub enum Multiplexer {
    Zellij(ZellijSession),
    Docker(DockerSession),
    #[cfg(test)]
    Mock(MockMultiplexer),
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Multiplexer::Zellij(session) => std::fmt::Debug::fmt(session, f),
            Multiplexer::Docker(session) => std::fmt::Debug::fmt(session, f),
            #[cfg(test)]
            Multiplexer::Mock(_) => f.write_str("MockMultiplexer"),
        }
    }
}

/// Creates a new backend session of the given type.
pub fn new_multiplexer(
    session_type: SessionType,
    name: &str,
    program: &str,
    opts: MultiplexerOptions,
) -> Multiplexer {
    match session_type {
        SessionType::DockerBind | SessionType::DockerClone => Multiplexer::Docker(
            DockerSession::new(
                name,
                program,
                session_type,
                DockerOptions {
                    base_image: opts.base_image,
                    repo_url: opts.repo_url,
                    branch_name: opts.branch_name,
                    work_dir: opts.work_dir,
                },
            ),
        ),
        SessionType::Zellij => Multiplexer::Zellij(ZellijSession::new(name, program)),
    }
}

/// True if the backend for the given session type is usable on this host.
pub async fn is_multiplexer_available(session_type: SessionType) -> bool {
    match session_type {
        SessionType::DockerBind | SessionType::DockerClone => docker::is_docker_available().await,
        SessionType::Zellij => zellij::is_available().await,
    }
}

impl Multiplexer {
    /// Creates and starts a new session with the given working directory.
    pub async fn start(&mut self, work_dir: &Path) -> Result<()> {
        match self {
            Multiplexer::Zellij(session) => session.start(work_dir).await,
            Multiplexer::Docker(session) => session.start(work_dir).await,
            #[cfg(test)]
            Multiplexer::Mock(mock) => mock.start(work_dir),
        }
    }

    /// Re-establishes monitoring of an existing session.
    pub async fn restore(&mut self) -> Result<()> {
        match self {
            Multiplexer::Zellij(session) => session.restore().await,
            Multiplexer::Docker(session) => session.restore().await,
            #[cfg(test)]
            Multiplexer::Mock(mock) => mock.restore(),
        }
    }

    /// Attaches for interactive use. The returned channel closes when the
    /// user detaches with Ctrl+Q.
    pub async fn attach(&mut self) -> Result<mpsc::Receiver<()>> {
        match self {
            Multiplexer::Zellij(session) => session.attach().await,
            Multiplexer::Docker(_) => {
                // Containers are monitored through the exec PTY; there is no
                // separate interactive attach surface yet.
                let (_tx, rx) = mpsc::channel(1);
                Ok(rx)
            }
            #[cfg(test)]
            Multiplexer::Mock(_) => {
                let (_tx, rx) = mpsc::channel(1);
                Ok(rx)
            }
        }
    }

    /// Disconnects from the session. Panics if the PTY cannot be restored;
    /// use `detach_safely` on non-interactive paths.
    pub async fn detach(&mut self) {
        match self {
            Multiplexer::Zellij(session) => session.detach().await,
            Multiplexer::Docker(session) => session.detach().await,
            #[cfg(test)]
            Multiplexer::Mock(_) => {}
        }
    }

    /// Disconnects from the session without panicking.
    pub async fn detach_safely(&mut self) -> Result<()> {
        match self {
            Multiplexer::Zellij(session) => session.detach_safely().await,
            Multiplexer::Docker(session) => session.detach_safely().await,
            #[cfg(test)]
            Multiplexer::Mock(mock) => mock.detach_safely(),
        }
    }

    /// Terminates the session and cleans up its resources.
    pub async fn close(&mut self) -> Result<()> {
        match self {
            Multiplexer::Zellij(session) => session.close().await,
            Multiplexer::Docker(session) => session.close().await,
            #[cfg(test)]
            Multiplexer::Mock(mock) => mock.close(),
        }
    }

    /// Sends keystrokes to the session.
    pub async fn send_keys(&mut self, keys: &str) -> Result<()> {
        match self {
            Multiplexer::Zellij(session) => session.send_keys(keys).await,
            Multiplexer::Docker(session) => session.send_keys(keys),
            #[cfg(test)]
            Multiplexer::Mock(mock) => mock.send_keys(keys),
        }
    }

    /// Sends an enter keystroke.
    pub async fn tap_enter(&mut self) -> Result<()> {
        match self {
            Multiplexer::Zellij(session) => session.tap_enter().await,
            Multiplexer::Docker(session) => session.tap_enter(),
            #[cfg(test)]
            Multiplexer::Mock(mock) => mock.tap_enter(),
        }
    }

    /// Sends 'D' followed by enter (for Aider/Gemini confirmations).
    pub async fn tap_d_and_enter(&mut self) -> Result<()> {
        match self {
            Multiplexer::Zellij(session) => session.tap_d_and_enter().await,
            Multiplexer::Docker(session) => session.tap_d_and_enter(),
            #[cfg(test)]
            Multiplexer::Mock(mock) => mock.tap_enter(),
        }
    }

    /// Captures the current visible pane content.
    pub async fn capture_pane_content(&self) -> Result<String> {
        match self {
            Multiplexer::Zellij(session) => session.capture_pane_content().await,
            Multiplexer::Docker(session) => session.capture_pane_content(),
            #[cfg(test)]
            Multiplexer::Mock(mock) => mock.capture_pane_content(),
        }
    }

    /// Captures pane content with scroll history ("-"/"-" for everything).
    pub async fn capture_pane_content_with_options(
        &self,
        start: &str,
        end: &str,
    ) -> Result<String> {
        match self {
            Multiplexer::Zellij(session) => {
                session.capture_pane_content_with_options(start, end).await
            }
            // Containers have no scroll history beyond the live screen.
            Multiplexer::Docker(session) => session.capture_pane_content(),
            #[cfg(test)]
            Multiplexer::Mock(mock) => mock.capture_pane_content_with_options(start, end),
        }
    }

    /// Checks whether pane content changed since the last call, and whether
    /// a confirmation prompt is waiting.
    pub async fn has_updated(&mut self) -> (bool, bool) {
        match self {
            Multiplexer::Zellij(session) => session.has_updated().await,
            Multiplexer::Docker(session) => session.has_updated(),
            #[cfg(test)]
            Multiplexer::Mock(mock) => mock.has_updated(),
        }
    }

    /// True if the underlying session or container exists.
    pub async fn does_session_exist(&self) -> bool {
        match self {
            Multiplexer::Zellij(session) => session.does_session_exist().await,
            Multiplexer::Docker(session) => session.does_session_exist().await,
            #[cfg(test)]
            Multiplexer::Mock(mock) => mock.exists,
        }
    }

    /// Sets the pane dimensions while detached.
    pub fn set_detached_size(&self, width: u16, height: u16) -> Result<()> {
        match self {
            Multiplexer::Zellij(session) => session.set_detached_size(width, height),
            Multiplexer::Docker(session) => session.set_detached_size(width, height),
            #[cfg(test)]
            Multiplexer::Mock(_) => Ok(()),
        }
    }

    /// The program this session runs.
    pub fn get_program(&self) -> &str {
        match self {
            Multiplexer::Zellij(session) => session.get_program(),
            Multiplexer::Docker(session) => session.get_program(),
            #[cfg(test)]
            Multiplexer::Mock(mock) => &mock.program,
        }
    }

    /// True if the agent program is actively running in the session.
    pub async fn is_program_running(&self) -> Result<bool> {
        match self {
            Multiplexer::Zellij(session) => session.is_program_running().await,
            Multiplexer::Docker(session) => session.is_program_running().await,
            #[cfg(test)]
            Multiplexer::Mock(mock) => Ok(mock.program_running),
        }
    }

    /// Relaunches the program in the existing session.
    pub async fn restart_program(&mut self, args: &str) -> Result<()> {
        match self {
            Multiplexer::Zellij(session) => session.restart_program(args).await,
            Multiplexer::Docker(session) => session.restart_program(args).await,
            #[cfg(test)]
            Multiplexer::Mock(mock) => mock.restart_program(args),
        }
    }
}

/// Scriptable in-memory backend used by unit tests to simulate session
/// behavior without a live multiplexer or container.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MockMultiplexer {
    pub program: String,
    pub exists: bool,
    pub program_running: bool,
    pub content: String,
    pub full_history: String,
    /// Scripted (updated, has_prompt) results, consumed front to back.
    pub updates: std::collections::VecDeque<(bool, bool)>,
    pub sent_keys: Vec<String>,
    pub enter_taps: usize,
    pub restarts: Vec<String>,
    pub started: bool,
    pub closed: bool,
}

#[cfg(test)]
impl MockMultiplexer {
    pub fn new() -> Self {
        Self {
            program: "claude".to_string(),
            exists: true,
            program_running: true,
            ..Default::default()
        }
    }

    fn start(&mut self, _work_dir: &Path) -> Result<()> {
        self.started = true;
        self.exists = true;
        Ok(())
    }

    fn restore(&mut self) -> Result<()> {
        if !self.exists {
            anyhow::bail!("session does not exist");
        }
        Ok(())
    }

    fn detach_safely(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.exists = false;
        Ok(())
    }

    fn send_keys(&mut self, keys: &str) -> Result<()> {
        self.sent_keys.push(keys.to_string());
        Ok(())
    }

    fn tap_enter(&mut self) -> Result<()> {
        self.enter_taps += 1;
        Ok(())
    }

    fn capture_pane_content(&self) -> Result<String> {
        Ok(self.content.clone())
    }

    fn capture_pane_content_with_options(&self, start: &str, end: &str) -> Result<String> {
        if start == "-" && end == "-" {
            return Ok(self.full_history.clone());
        }
        Ok(self.content.clone())
    }

    fn has_updated(&mut self) -> (bool, bool) {
        self.updates.pop_front().unwrap_or((false, false))
    }

    fn restart_program(&mut self, args: &str) -> Result<()> {
        self.restarts.push(args.to_string());
        self.program_running = true;
        Ok(())
    }
}
