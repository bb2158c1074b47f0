// ABOUTME: Instance lifecycle: the state machine binding a git worktree, a
// backend session, and a running agent program into one recoverable unit

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};

pub mod backend;
pub mod claude_session;
pub mod parallel;
pub mod storage;
pub mod summarizer;

pub use backend::{new_multiplexer, Multiplexer, MultiplexerOptions};
pub use storage::{InstanceData, Storage};
pub use summarizer::Summarizer;

use crate::config::SessionType;
use crate::git::{DiffStats, GitWorktree, ProgressCallback};
use crate::zellij::OrphanedSession;
use claude_session::{extract_claude_session_id, ClaudeSessionError};

/// Maximum title length accepted at creation and rename.
pub const MAX_TITLE_LEN: usize = 32;

/// Diff stats are recomputed at most every 30 seconds per instance.
const DIFF_UPDATE_INTERVAL: Duration = Duration::from_secs(30);
/// And only once the instance has been quiet for 10 seconds.
const DIFF_ACTIVITY_DELAY: Duration = Duration::from_secs(10);

/// The lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Status {
    /// The agent is working.
    Running,
    /// The agent is waiting for user input.
    Ready,
    /// The instance is starting up.
    Loading,
    /// Worktree removed, branch preserved, backend detached.
    Paused,
}

impl From<Status> for u8 {
    fn from(status: Status) -> u8 {
        match status {
            Status::Running => 0,
            Status::Ready => 1,
            Status::Loading => 2,
            Status::Paused => 3,
        }
    }
}

impl TryFrom<u8> for Status {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Status::Running),
            1 => Ok(Status::Ready),
            2 => Ok(Status::Loading),
            3 => Ok(Status::Paused),
            other => Err(format!("unknown status value: {other}")),
        }
    }
}

/// Combines multiple errors into one multi-line error.
pub(crate) fn combine_errors(mut errs: Vec<anyhow::Error>) -> Option<anyhow::Error> {
    match errs.len() {
        0 => None,
        1 => Some(errs.remove(0)),
        _ => {
            let mut msg = String::from("multiple cleanup errors occurred:");
            for err in &errs {
                msg.push_str("\n  - ");
                msg.push_str(&format!("{err:#}"));
            }
            Some(anyhow::anyhow!(msg))
        }
    }
}

/// Options for creating a new instance.
#[derive(Debug, Clone, Default)]
pub struct InstanceOptions {
    /// Unique human-supplied identifier, 1-32 characters.
    pub title: String,
    /// Path to the originating repository.
    pub path: PathBuf,
    /// Command line of the agent to run inside the session.
    pub program: String,
    /// Automatically confirm agent prompts with an enter keystroke.
    pub auto_yes: bool,
    /// Backend kind for this instance.
    pub session_type: SessionType,
    /// Base Docker image for Docker sessions.
    pub docker_base_image: String,
    /// Git repo URL for docker-clone mode.
    pub docker_repo_url: String,
}

/// A running instance of an agent program.
pub struct Instance {
    /// Display title; also the stable key while the instance lives.
    pub title: String,
    /// Path to the originating repository.
    pub path: PathBuf,
    /// Branch the worktree checks out.
    pub branch: String,
    /// Lifecycle state.
    pub status: Status,
    /// Program running inside the session.
    pub program: String,
    /// Preview pane dimensions.
    pub height: u16,
    pub width: u16,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the user last attached to this instance.
    pub last_opened_at: Option<DateTime<Utc>>,
    /// Automatically press enter when the agent prompts.
    pub auto_yes: bool,
    /// Initial prompt to send on startup.
    pub prompt: String,
    /// Soft-hide flag; archived implies paused semantics.
    pub archived: bool,

    /// Short description of current activity.
    pub summary: String,
    pub summary_updated_at: Option<DateTime<Utc>>,

    /// Agent session ID captured from its project files, used to resume
    /// conversation state after a host restart.
    pub claude_session_id: String,

    pub session_type: SessionType,
    pub docker_container_id: String,
    pub docker_repo_url: String,
    pub docker_base_image: String,

    diff_stats: Option<DiffStats>,

    // Rate-limit clocks, not persisted.
    last_diff_update: Option<Instant>,
    last_activity: Option<Instant>,

    // Initialized by start().
    started: bool,
    session: Option<Multiplexer>,
    git_worktree: Option<GitWorktree>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("title", &self.title)
            .field("branch", &self.branch)
            .field("status", &self.status)
            .field("session_type", &self.session_type)
            .field("started", &self.started)
            .finish()
    }
}

impl Instance {
    /// Creates a new, unstarted instance.
    pub fn new(opts: InstanceOptions) -> Result<Self> {
        validate_title(&opts.title)?;

        let now = Utc::now();
        let abs_path = opts
            .path
            .canonicalize()
            .unwrap_or_else(|_| opts.path.clone());

        Ok(Self {
            title: opts.title,
            path: abs_path,
            branch: String::new(),
            status: Status::Ready,
            program: opts.program,
            height: 0,
            width: 0,
            created_at: now,
            updated_at: now,
            last_opened_at: None,
            auto_yes: opts.auto_yes,
            prompt: String::new(),
            archived: false,
            summary: String::new(),
            summary_updated_at: None,
            claude_session_id: String::new(),
            session_type: opts.session_type,
            docker_container_id: String::new(),
            docker_repo_url: opts.docker_repo_url,
            docker_base_image: opts.docker_base_image,
            diff_stats: None,
            last_diff_update: None,
            last_activity: None,
            started: false,
            session: None,
            git_worktree: None,
        })
    }

    /// Reconstructs an instance from recovered orphaned session data.
    pub async fn from_orphan(orphan: &OrphanedSession) -> Result<Self> {
        if orphan.session_name.is_empty() {
            anyhow::bail!("orphan session name is empty");
        }
        if orphan.worktree_path.is_empty() {
            anyhow::bail!("orphan worktree path is empty");
        }

        // Fall back to the worktree path when the repo path was unrecoverable.
        let repo_path = if orphan.repo_path.is_empty() {
            orphan.worktree_path.clone()
        } else {
            orphan.repo_path.clone()
        };

        let git_worktree = GitWorktree::from_storage(
            PathBuf::from(repo_path),
            PathBuf::from(&orphan.worktree_path),
            orphan.title.clone(),
            orphan.branch_name.clone(),
            // Base commit is unknown for orphaned sessions; diffs stay off.
            None,
        );

        let now = Utc::now();
        let mut instance = Self {
            title: orphan.title.clone(),
            path: PathBuf::from(&orphan.worktree_path),
            branch: orphan.branch_name.clone(),
            status: Status::Running,
            program: orphan.program.clone(),
            height: 0,
            width: 0,
            created_at: now,
            updated_at: now,
            last_opened_at: None,
            auto_yes: false,
            prompt: String::new(),
            archived: false,
            summary: String::new(),
            summary_updated_at: None,
            claude_session_id: String::new(),
            // Orphaned sessions are always local-mux.
            session_type: SessionType::Zellij,
            docker_container_id: String::new(),
            docker_repo_url: String::new(),
            docker_base_image: String::new(),
            diff_stats: None,
            last_diff_update: None,
            last_activity: None,
            started: false,
            session: None,
            git_worktree: Some(git_worktree),
        };

        let mut session = new_multiplexer(
            SessionType::Zellij,
            instance
                .git_worktree
                .as_ref()
                .map(|wt| wt.session_name().to_string())
                .unwrap_or_else(|| instance.title.clone())
                .as_str(),
            &instance.program,
            MultiplexerOptions::default(),
        );

        session
            .restore()
            .await
            .context("failed to restore orphan session")?;

        instance.session = Some(session);
        instance.started = true;
        Ok(instance)
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn paused(&self) -> bool {
        self.status == Status::Paused
    }

    pub fn set_status(&mut self, status: Status) {
        self.status = status;
        self.last_activity = Some(Instant::now());
    }

    /// The repository name for display purposes.
    pub fn repo_name(&self) -> Result<String> {
        let worktree = self
            .git_worktree
            .as_ref()
            .context("cannot get repo name for instance that has not been started")?;
        Ok(worktree.repo_name())
    }

    pub fn git_worktree(&self) -> Option<&GitWorktree> {
        self.git_worktree.as_ref()
    }

    pub fn git_worktree_mut(&mut self) -> Option<&mut GitWorktree> {
        self.git_worktree.as_mut()
    }

    /// Starts the instance. `first_time` distinguishes a brand new instance
    /// (create worktree, spawn session, launch agent) from one loaded from
    /// storage (restore the existing session).
    pub async fn start(&mut self, first_time: bool) -> Result<()> {
        self.start_internal(first_time, None).await
    }

    /// As `start`, reporting progress messages through the callback.
    pub async fn start_with_progress(
        &mut self,
        first_time: bool,
        progress: ProgressCallback,
    ) -> Result<()> {
        self.start_internal(first_time, Some(progress)).await
    }

    async fn start_internal(
        &mut self,
        first_time: bool,
        progress: Option<ProgressCallback>,
    ) -> Result<()> {
        if self.title.is_empty() {
            anyhow::bail!("instance title cannot be empty");
        }

        let is_docker_clone = self.session_type == SessionType::DockerClone;

        if first_time && !is_docker_clone {
            let (mut worktree, branch_name) = GitWorktree::new(&self.path, &self.title)
                .context("failed to create git worktree")?;
            if let Some(progress) = &progress {
                worktree.set_progress_callback(progress.clone());
            }
            self.git_worktree = Some(worktree);
            self.branch = branch_name;
        } else if first_time && is_docker_clone {
            // The repository is cloned inside the container; the branch is
            // simply named after the instance.
            self.branch = self.title.clone();
        }

        if self.session.is_none() {
            let session_name = self
                .git_worktree
                .as_ref()
                .map(|wt| wt.session_name().to_string())
                .unwrap_or_else(|| self.title.clone());

            self.session = Some(new_multiplexer(
                self.session_type,
                &session_name,
                &self.program,
                MultiplexerOptions {
                    base_image: self.docker_base_image.clone(),
                    repo_url: self.docker_repo_url.clone(),
                    branch_name: self.branch.clone(),
                    work_dir: self.path.to_string_lossy().into_owned(),
                },
            ));
        }

        let setup_result = self.do_start(first_time, progress).await;
        match setup_result {
            Ok(()) => {
                self.started = true;
                self.set_status(Status::Running);
                Ok(())
            }
            Err(e) => {
                // Tear down whatever was partially created.
                match self.kill_resources().await {
                    Ok(()) => Err(e),
                    Err(cleanup_err) => Err(anyhow::anyhow!("{e:#} (cleanup error: {cleanup_err:#})")),
                }
            }
        }
    }

    async fn do_start(&mut self, first_time: bool, progress: Option<ProgressCallback>) -> Result<()> {
        if !first_time {
            // Reuse the existing session.
            let session = self.session.as_mut().context("session not initialized")?;
            return session
                .restore()
                .await
                .context("failed to restore existing session");
        }

        // Docker-clone mode has no worktree; the repo lives in the container.
        if let Some(worktree) = self.git_worktree.as_mut() {
            worktree
                .setup()
                .map_err(|e| anyhow::anyhow!(e))
                .context("failed to setup git worktree")?;
        }

        if let Some(progress) = &progress {
            progress("Starting terminal session...");
        }

        let work_dir = self
            .git_worktree
            .as_ref()
            .map(|wt| wt.worktree_path().to_path_buf())
            .unwrap_or_else(|| self.path.clone());

        let session = self.session.as_mut().context("session not initialized")?;
        if let Err(e) = session.start(&work_dir).await {
            // The worktree was created above; take it back down.
            let mut err = anyhow::anyhow!("{e:#}");
            if let Some(worktree) = self.git_worktree.as_mut() {
                if let Err(cleanup_err) = worktree.cleanup() {
                    err = anyhow::anyhow!("{e:#} (cleanup error: {cleanup_err})");
                }
            }
            return Err(err.context("failed to start new session"));
        }

        Ok(())
    }

    /// Terminates the instance and cleans up all of its resources.
    pub async fn kill(&mut self) -> Result<()> {
        if !self.started {
            // Never started means nothing to clean up.
            return Ok(());
        }
        self.kill_resources().await
    }

    /// Closes the backend session and removes the worktree and branch,
    /// accumulating every individual failure.
    async fn kill_resources(&mut self) -> Result<()> {
        let mut errs: Vec<anyhow::Error> = Vec::new();

        // The session uses the worktree directory; close it first.
        if let Some(session) = self.session.as_mut() {
            if let Err(e) = session.close().await {
                errs.push(e.context("failed to close session"));
            }
        }

        if let Some(worktree) = self.git_worktree.as_mut() {
            if let Err(e) = worktree.cleanup() {
                errs.push(anyhow::anyhow!(e).context("failed to cleanup git worktree"));
            }
        }

        combine_errors(errs).map_or(Ok(()), Err)
    }

    /// Captures the visible pane content for the preview.
    pub async fn preview(&self) -> Result<String> {
        if !self.started || self.status == Status::Paused {
            return Ok(String::new());
        }
        let session = self.session.as_ref().context("session not initialized")?;
        session.capture_pane_content().await
    }

    /// Captures the entire pane output including full scrollback history.
    pub async fn preview_full_history(&self) -> Result<String> {
        if !self.started || self.status == Status::Paused {
            return Ok(String::new());
        }
        let session = self.session.as_ref().context("session not initialized")?;
        session.capture_pane_content_with_options("-", "-").await
    }

    /// Checks whether the pane content changed since the last call.
    pub async fn has_updated(&mut self) -> (bool, bool) {
        if !self.started {
            return (false, false);
        }
        match self.session.as_mut() {
            Some(session) => session.has_updated().await,
            None => (false, false),
        }
    }

    /// Sends an enter keystroke if auto-yes is enabled for this instance.
    pub async fn tap_enter(&mut self) {
        if !self.started || !self.auto_yes {
            return;
        }
        if let Some(session) = self.session.as_mut() {
            if let Err(e) = session.tap_enter().await {
                tracing::error!("error tapping enter: {e}");
            }
        }
    }

    /// Attaches to the session for interactive use.
    pub async fn attach(&mut self) -> Result<mpsc::Receiver<()>> {
        if !self.started {
            anyhow::bail!("cannot attach instance that has not been started");
        }
        self.last_opened_at = Some(Utc::now());
        let session = self.session.as_mut().context("session not initialized")?;
        session.attach().await
    }

    /// Sets the preview pane dimensions.
    pub fn set_preview_size(&mut self, width: u16, height: u16) -> Result<()> {
        if !self.started || self.status == Status::Paused {
            anyhow::bail!(
                "cannot set preview size for instance that has not been started or is paused"
            );
        }
        self.width = width;
        self.height = height;
        let session = self.session.as_ref().context("session not initialized")?;
        session.set_detached_size(width, height)
    }

    /// True if the backend session is alive. A sanity check before attach.
    pub async fn session_alive(&self) -> bool {
        match self.session.as_ref() {
            Some(session) => session.does_session_exist().await,
            None => false,
        }
    }

    /// Changes the display title. The underlying session name and worktree
    /// path are derived from the original title and remain unchanged.
    pub fn rename(&mut self, new_title: &str) -> Result<()> {
        validate_title(new_title)?;
        self.title = new_title.to_string();
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Stops the session and removes the worktree, preserving the branch.
    /// Dirty worktrees are committed first so no work is lost.
    pub async fn pause(&mut self) -> Result<()> {
        if !self.started {
            anyhow::bail!("cannot pause instance that has not been started");
        }
        if self.status == Status::Paused {
            anyhow::bail!("instance is already paused");
        }

        let mut errs: Vec<anyhow::Error> = Vec::new();

        let worktree = self
            .git_worktree
            .as_mut()
            .context("instance has no git worktree")?;

        match worktree.is_dirty() {
            Err(e) => {
                errs.push(anyhow::anyhow!(e).context("failed to check if worktree is dirty"));
            }
            Ok(true) => {
                let commit_msg = format!(
                    "[claudesquad] update from '{}' on {} (paused)",
                    self.title,
                    Utc::now().to_rfc2822()
                );
                if let Err(e) = worktree.commit_changes(&commit_msg) {
                    errs.push(anyhow::anyhow!(e).context("failed to commit changes"));
                    // Stop here rather than discard uncommitted work.
                    return Err(combine_errors(errs).unwrap());
                }
            }
            Ok(false) => {}
        }

        // Detach instead of closing so the session output is preserved.
        if let Some(session) = self.session.as_mut() {
            if let Err(e) = session.detach_safely().await {
                errs.push(e.context("failed to detach session"));
                // Continue; the worktree must still come down.
            }
        }

        let worktree = self
            .git_worktree
            .as_mut()
            .context("instance has no git worktree")?;
        if worktree.worktree_path().exists() {
            if let Err(e) = worktree.remove() {
                errs.push(anyhow::anyhow!(e).context("failed to remove git worktree"));
                return Err(combine_errors(errs).unwrap());
            }
            if let Err(e) = worktree.prune() {
                errs.push(anyhow::anyhow!(e).context("failed to prune git worktrees"));
                return Err(combine_errors(errs).unwrap());
            }
        }

        if let Some(err) = combine_errors(errs) {
            return Err(err);
        }

        self.set_status(Status::Paused);
        Ok(())
    }

    /// Recreates the worktree and restarts or restores the session.
    pub async fn resume(&mut self) -> Result<()> {
        if !self.started {
            anyhow::bail!("cannot resume instance that has not been started");
        }
        if self.status != Status::Paused {
            anyhow::bail!("can only resume paused instances");
        }

        let worktree = self
            .git_worktree
            .as_mut()
            .context("instance has no git worktree")?;

        match worktree.is_branch_checked_out() {
            Err(e) => {
                return Err(anyhow::anyhow!(e).context("failed to check if branch is checked out"));
            }
            Ok(true) => {
                anyhow::bail!(
                    "cannot resume: branch is checked out, please switch to a different branch"
                );
            }
            Ok(false) => {}
        }

        worktree
            .setup()
            .map_err(|e| anyhow::anyhow!(e).context("failed to setup git worktree"))?;
        worktree.invalidate_diff_cache();
        let work_dir = worktree.worktree_path().to_path_buf();

        let session = self.session.as_mut().context("session not initialized")?;
        let restored = if session.does_session_exist().await {
            match session.restore().await {
                Ok(()) => true,
                Err(e) => {
                    warn!("failed to restore session on resume, starting fresh: {e}");
                    false
                }
            }
        } else {
            false
        };

        if !restored {
            if let Err(e) = session.start(&work_dir).await {
                let mut err = anyhow::anyhow!("{e:#}");
                if let Some(worktree) = self.git_worktree.as_mut() {
                    if let Err(cleanup_err) = worktree.cleanup() {
                        err = anyhow::anyhow!("{e:#} (cleanup error: {cleanup_err})");
                    }
                }
                return Err(err.context("failed to start new session"));
            }
        }

        self.set_status(Status::Running);
        Ok(())
    }

    /// Marks the instance archived, pausing it first if needed.
    pub async fn archive(&mut self) -> Result<()> {
        if self.started && self.status != Status::Paused {
            self.pause().await?;
        }
        self.archived = true;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Clears the archived flag. The instance stays paused.
    pub fn unarchive(&mut self) -> Result<()> {
        if !self.archived {
            anyhow::bail!("instance is not archived");
        }
        self.archived = false;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Recomputes the git diff statistics for this instance.
    pub fn update_diff_stats(&mut self) -> Result<()> {
        if !self.started {
            self.diff_stats = None;
            return Ok(());
        }
        if self.status == Status::Paused {
            // Keep the stats from before the pause.
            return Ok(());
        }

        let worktree = self
            .git_worktree
            .as_mut()
            .context("instance has no git worktree")?;
        let stats = worktree.diff();

        if let Some(error) = &stats.error {
            if error.contains(crate::git::diff::BASE_COMMIT_UNSET) {
                // The worktree is not fully set up yet; not an error.
                self.diff_stats = None;
                return Ok(());
            }
            anyhow::bail!("failed to get diff stats: {error}");
        }

        self.diff_stats = Some(stats);
        self.last_diff_update = Some(Instant::now());
        Ok(())
    }

    pub fn diff_stats(&self) -> Option<&DiffStats> {
        self.diff_stats.as_ref()
    }

    /// True when the instance is due for a diff stats update: at least 10
    /// seconds since the last activity and at most once every 30 seconds.
    pub fn should_update_diff(&self) -> bool {
        if !self.started || self.status == Status::Paused {
            return false;
        }
        if let Some(last_diff) = self.last_diff_update {
            if last_diff.elapsed() < DIFF_UPDATE_INTERVAL {
                return false;
            }
        }
        if let Some(last_activity) = self.last_activity {
            if last_activity.elapsed() < DIFF_ACTIVITY_DELAY {
                return false;
            }
        }
        true
    }

    /// Sends a prompt to the session: the text, a beat, then enter. The pause
    /// keeps the carriage return from being coalesced with the text.
    pub async fn send_prompt(&mut self, prompt: &str) -> Result<()> {
        if !self.started {
            anyhow::bail!("instance not started");
        }
        let session = self.session.as_mut().context("session not initialized")?;
        session
            .send_keys(prompt)
            .await
            .context("error sending keys to session")?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        session.tap_enter().await.context("error tapping enter")?;
        Ok(())
    }

    /// Sends raw keystrokes to the session.
    pub async fn send_keys(&mut self, keys: &str) -> Result<()> {
        if !self.started || self.status == Status::Paused {
            anyhow::bail!("cannot send keys to instance that has not been started or is paused");
        }
        let session = self.session.as_mut().context("session not initialized")?;
        session.send_keys(keys).await
    }

    /// Checks whether the agent program died (e.g. after a host reboot where
    /// the session survived) and restarts it if so. Claude instances restart
    /// with `--resume` when a session ID was captured.
    ///
    /// Returns whether a restart was issued.
    pub async fn check_and_restart_program(&mut self) -> Result<bool> {
        if !self.started || self.status == Status::Paused {
            return Ok(false);
        }

        let claude_session_id = self.claude_session_id.clone();
        let program = self.program.clone();
        let session = self.session.as_mut().context("session not initialized")?;

        let running = session
            .is_program_running()
            .await
            .context("failed to check if program is running")?;
        if running {
            return Ok(false);
        }

        info!("program not running in instance {}, attempting restart", self.title);

        let mut args = String::new();
        if program.contains("claude") && !claude_session_id.is_empty() {
            args = format!("--resume {claude_session_id}");
            info!("restarting claude with session ID: {claude_session_id}");
        }

        session
            .restart_program(&args)
            .await
            .context("failed to restart program")?;
        Ok(true)
    }

    /// Captures and stores the agent's session ID from its project files.
    /// Expected-absence conditions (no project directory yet, no session
    /// files yet) are silent.
    pub fn capture_claude_session_id(&mut self) {
        if !self.program.contains("claude") {
            return;
        }

        let worktree_path = self
            .git_worktree
            .as_ref()
            .map(|wt| wt.worktree_path().to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.to_string_lossy().into_owned());

        match extract_claude_session_id(&worktree_path) {
            Ok(session_id) => {
                if !session_id.is_empty() && session_id != self.claude_session_id {
                    info!("captured claude session ID for {}: {session_id}", self.title);
                    self.claude_session_id = session_id;
                }
            }
            Err(ClaudeSessionError::ProjectNotFound | ClaudeSessionError::NoSessionFiles) => {}
            Err(e) => {
                warn!("failed to capture claude session ID for {}: {e}", self.title);
            }
        }
    }

    // -- Test support --

    /// Replaces the backend session. Test seam only.
    #[cfg(test)]
    pub(crate) fn set_session(&mut self, session: Multiplexer) {
        self.session = Some(session);
    }

    /// Marks the instance started without spawning anything. Test seam only.
    #[cfg(test)]
    pub(crate) fn mark_started(&mut self) {
        self.started = true;
        self.status = Status::Running;
    }

    #[cfg(test)]
    pub(crate) fn session_mut(&mut self) -> Option<&mut Multiplexer> {
        self.session.as_mut()
    }

    #[cfg(test)]
    pub(crate) fn set_timers(
        &mut self,
        last_diff_update: Option<Instant>,
        last_activity: Option<Instant>,
    ) {
        self.last_diff_update = last_diff_update;
        self.last_activity = last_activity;
    }

    #[cfg(test)]
    pub(crate) fn set_worktree(&mut self, worktree: GitWorktree) {
        self.git_worktree = Some(worktree);
    }
}

fn validate_title(title: &str) -> Result<()> {
    if title.is_empty() {
        anyhow::bail!("title cannot be empty");
    }
    if title.chars().count() > MAX_TITLE_LEN {
        anyhow::bail!("title cannot be longer than {MAX_TITLE_LEN} characters");
    }
    Ok(())
}

/// Recovers instances for every live, untracked backend session.
///
/// Partial success is expected: each failing session contributes an error to
/// the returned list while the others are still recovered.
pub async fn recover_orphaned_instances(
    tracked_titles: &[String],
) -> Result<(Vec<Instance>, Vec<anyhow::Error>)> {
    let orphans = crate::zellij::list_orphaned_sessions(tracked_titles).await?;

    let mut instances = Vec::new();
    let mut errors = Vec::new();

    for orphan in orphans {
        let recovered = match crate::zellij::recover_metadata(&orphan.session_name).await {
            Ok(recovered) => recovered,
            Err(e) => {
                errors.push(e.context(format!(
                    "failed to recover metadata for {}",
                    orphan.session_name
                )));
                continue;
            }
        };

        match Instance::from_orphan(&recovered).await {
            Ok(instance) => instances.push(instance),
            Err(e) => errors.push(e.context(format!(
                "failed to adopt orphaned session {}",
                recovered.session_name
            ))),
        }
    }

    Ok((instances, errors))
}
