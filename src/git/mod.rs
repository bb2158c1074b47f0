// ABOUTME: Git worktree management for creating isolated working directories for sessions

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub mod diff;
pub mod ops;
pub mod util;

pub use diff::DiffStats;
pub use ops::cleanup_worktrees;
pub use util::sanitize_branch_name;

use crate::config::{get_config_dir, Config};
use util::find_git_repo_root;

#[derive(Error, Debug)]
pub enum GitError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("git {command} failed: {output}")]
    CommandFailed { command: String, output: String },
    #[error("not a git repository: {0}")]
    NotARepository(String),
    #[error("this appears to be a brand new repository: please create an initial commit before creating an instance")]
    BrandNewRepository,
    #[error("could not find default branch (tried origin/HEAD, main, master)")]
    NoDefaultBranch,
    #[error("branch {0} is currently checked out in another worktree")]
    BranchCheckedOut(String),
    #[error("{0}")]
    Other(String),
}

/// Combines multiple errors into a single multi-line error.
/// Returns `None` when the list is empty.
pub(crate) fn combine_errors(errs: Vec<GitError>) -> Option<GitError> {
    match errs.len() {
        0 => None,
        1 => errs.into_iter().next(),
        _ => {
            let mut msg = String::from("multiple cleanup errors occurred:");
            for err in &errs {
                msg.push_str("\n  - ");
                msg.push_str(&err.to_string());
            }
            Some(GitError::Other(msg))
        }
    }
}

/// Callback invoked with status messages during long-running operations.
pub type ProgressCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Returns the directory under which all session worktrees live.
pub fn get_worktree_directory() -> Result<PathBuf, GitError> {
    let config_dir =
        get_config_dir().map_err(|e| GitError::Other(format!("config directory: {e}")))?;
    Ok(config_dir.join("worktrees"))
}

/// Manages git worktree operations for a single session.
pub struct GitWorktree {
    /// Path to the main repository.
    repo_path: PathBuf,
    /// Path to the worktree directory.
    worktree_path: PathBuf,
    /// Original session name, stable across renames.
    session_name: String,
    /// Branch the worktree checks out.
    branch_name: String,
    /// Commit diffs are computed against.
    base_commit_sha: Option<String>,
    /// Progress callback for status updates.
    progress_callback: Option<ProgressCallback>,

    // Diff caching
    cached_diff_stats: Option<DiffStats>,
    diff_cache_time: Option<Instant>,
    diff_cache_duration: Duration,
}

impl std::fmt::Debug for GitWorktree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitWorktree")
            .field("repo_path", &self.repo_path)
            .field("worktree_path", &self.worktree_path)
            .field("session_name", &self.session_name)
            .field("branch_name", &self.branch_name)
            .field("base_commit_sha", &self.base_commit_sha)
            .finish()
    }
}

impl GitWorktree {
    /// Create a new worktree descriptor for a session.
    ///
    /// Returns the descriptor together with the derived branch name. Nothing
    /// is created on disk until `setup` is called.
    pub fn new(repo_path: &Path, session_name: &str) -> Result<(Self, String), GitError> {
        let config = Config::load();
        let worktree_dir = get_worktree_directory()?;
        Self::new_with_base_dir(repo_path, session_name, &config.branch_prefix, &worktree_dir)
    }

    /// Like `new`, but with the branch prefix and worktree base directory
    /// supplied explicitly instead of read from the loaded config.
    pub fn new_with_base_dir(
        repo_path: &Path,
        session_name: &str,
        branch_prefix: &str,
        worktree_dir: &Path,
    ) -> Result<(Self, String), GitError> {
        // Sanitize the final branch name to handle invalid characters from any
        // source, e.g. backslashes from Windows domain usernames.
        let branch_name = sanitize_branch_name(&format!("{branch_prefix}{session_name}"));

        let abs_path = repo_path
            .canonicalize()
            .unwrap_or_else(|_| repo_path.to_path_buf());
        let repo_path = find_git_repo_root(&abs_path)?;

        // The suffix keeps worktree paths unique even when titles repeat.
        let suffix = extract_suffix_from_session_name(session_name)
            .unwrap_or_else(|| format!("{:x}", nanos_since_epoch()));
        let worktree_path = worktree_dir.join(format!("{branch_name}_{suffix}"));

        Ok((
            Self {
                repo_path,
                worktree_path,
                session_name: session_name.to_string(),
                branch_name: branch_name.clone(),
                base_commit_sha: None,
                progress_callback: None,
                cached_diff_stats: None,
                diff_cache_time: None,
                diff_cache_duration: diff::DEFAULT_DIFF_CACHE_DURATION,
            },
            branch_name,
        ))
    }

    /// Reconstruct a worktree descriptor from persisted data.
    pub fn from_storage(
        repo_path: PathBuf,
        worktree_path: PathBuf,
        session_name: String,
        branch_name: String,
        base_commit_sha: Option<String>,
    ) -> Self {
        Self {
            repo_path,
            worktree_path,
            session_name,
            branch_name,
            base_commit_sha,
            progress_callback: None,
            cached_diff_stats: None,
            diff_cache_time: None,
            diff_cache_duration: diff::DEFAULT_DIFF_CACHE_DURATION,
        }
    }

    pub fn worktree_path(&self) -> &Path {
        &self.worktree_path
    }

    pub fn branch_name(&self) -> &str {
        &self.branch_name
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// The name of the repository (last component of the repo path).
    pub fn repo_name(&self) -> String {
        self.repo_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn base_commit_sha(&self) -> Option<&str> {
        self.base_commit_sha.as_deref()
    }

    /// The original name used to create the backend session. Does not change
    /// when the instance is renamed.
    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    pub fn set_progress_callback(&mut self, callback: ProgressCallback) {
        self.progress_callback = Some(callback);
    }

    pub(crate) fn report_progress(&self, message: &str) {
        if let Some(callback) = &self.progress_callback {
            callback(message);
        }
    }
}

fn nanos_since_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Extracts the random word suffix from a session name, if present.
///
/// Session names carry a `_word` suffix added at creation time; the word is
/// reused in the worktree path so paths stay unique across recreations.
fn extract_suffix_from_session_name(session_name: &str) -> Option<String> {
    let last = session_name.rsplit('_').next()?;
    if last != session_name && is_word_suffix(last) {
        return Some(last.to_string());
    }
    None
}

/// A word suffix is 3-15 lowercase ASCII letters.
fn is_word_suffix(s: &str) -> bool {
    (3..=15).contains(&s.len()) && s.bytes().all(|b| b.is_ascii_lowercase())
}
