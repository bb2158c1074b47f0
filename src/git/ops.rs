// ABOUTME: Worktree lifecycle operations: setup, teardown, commit, push, inspection

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::util::run_git_command;
use super::{combine_errors, get_worktree_directory, GitError, GitWorktree};

/// Commands auto-approved inside worktrees via the agent's settings file.
pub const DEFAULT_ALLOWED_COMMANDS: &[&str] = &["Bash(git:*)", "Bash(gh:*)"];

#[derive(Serialize)]
struct ClaudeSettings {
    permissions: ClaudePermissions,
}

#[derive(Serialize)]
struct ClaudePermissions {
    allow: Vec<String>,
}

impl GitWorktree {
    /// Creates the worktree on disk.
    ///
    /// If the target branch already exists a worktree is added pointing at it
    /// and the base commit becomes the merge-base with the default branch.
    /// Otherwise a new branch is created from HEAD, which becomes the base.
    pub fn setup(&mut self) -> Result<(), GitError> {
        self.report_progress("Preparing worktree directory...");

        let worktrees_dir = self
            .worktree_path()
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| GitError::Other("worktree path has no parent".to_string()))?;
        let repo_path = self.repo_path().to_path_buf();
        let branch_name = self.branch_name().to_string();

        // Directory creation and the branch-existence check are independent;
        // run them in parallel and join the errors.
        let branch_already_exists = std::thread::scope(|scope| {
            let mkdir = scope.spawn(|| fs::create_dir_all(&worktrees_dir).map_err(GitError::Io));
            let check = scope.spawn(|| branch_exists(&repo_path, &branch_name));

            let mkdir_result = mkdir
                .join()
                .unwrap_or_else(|_| Err(GitError::Other("directory creation panicked".into())));
            let check_result = check
                .join()
                .unwrap_or_else(|_| Err(GitError::Other("branch check panicked".into())));
            mkdir_result.and(check_result)
        })?;

        if branch_already_exists {
            self.report_progress(&format!(
                "Setting up worktree from existing branch '{}'...",
                self.branch_name()
            ));
            self.setup_from_existing_branch()
        } else {
            self.report_progress(&format!(
                "Creating new worktree with branch '{}'...",
                self.branch_name()
            ));
            self.setup_new_worktree()
        }
    }

    /// Creates a worktree from an already-existing branch.
    fn setup_from_existing_branch(&mut self) -> Result<(), GitError> {
        // Force-remove any stale worktree left at the target path.
        self.report_progress("Cleaning up existing worktree...");
        let worktree_path = self.worktree_path().to_string_lossy().into_owned();
        let _ = run_git_command(
            self.repo_path(),
            &["worktree", "remove", "-f", &worktree_path],
        );

        self.report_progress("Creating worktree...");
        let branch = self.branch_name().to_string();
        run_git_command(self.repo_path(), &["worktree", "add", &worktree_path, &branch])?;

        // Diff stats are computed against the merge-base with the default
        // branch; if that cannot be determined, diffs stay disabled.
        self.report_progress("Computing base commit for diff...");
        if let Err(e) = self.compute_base_commit_sha() {
            warn!("could not compute base commit SHA: {e}");
        }

        if let Err(e) = self.create_claude_settings_file() {
            warn!("failed to create agent settings file: {e}");
        }

        self.report_progress("Worktree ready");
        Ok(())
    }

    /// Creates a worktree and a new branch from the repository HEAD.
    fn setup_new_worktree(&mut self) -> Result<(), GitError> {
        self.report_progress("Cleaning up existing worktree...");
        let worktree_path = self.worktree_path().to_string_lossy().into_owned();
        let _ = run_git_command(
            self.repo_path(),
            &["worktree", "remove", "-f", &worktree_path],
        );

        self.report_progress("Getting HEAD commit...");
        let head_commit = match run_git_command(self.repo_path(), &["rev-parse", "HEAD"]) {
            Ok(output) => output.trim().to_string(),
            Err(GitError::CommandFailed { output, .. })
                if output.contains("ambiguous argument 'HEAD'")
                    || output.contains("not a valid object name") =>
            {
                return Err(GitError::BrandNewRepository);
            }
            Err(e) => return Err(e),
        };
        self.set_base_commit_sha(head_commit.clone());

        // Branch from the HEAD commit, not the current branch, so the new
        // worktree starts from a clean slate without uncommitted changes.
        self.report_progress("Creating worktree...");
        let branch = self.branch_name().to_string();
        run_git_command(
            self.repo_path(),
            &["worktree", "add", "-b", &branch, &worktree_path, &head_commit],
        )?;

        if let Err(e) = self.create_claude_settings_file() {
            warn!("failed to create agent settings file: {e}");
        }

        self.report_progress("Worktree ready");
        Ok(())
    }

    /// Removes the worktree and its branch. Missing resources are non-errors;
    /// all individual failures are accumulated into one combined error.
    pub fn cleanup(&mut self) -> Result<(), GitError> {
        let mut errs: Vec<GitError> = Vec::new();

        let worktree_path = self.worktree_path().to_string_lossy().into_owned();
        match fs::metadata(self.worktree_path()) {
            Ok(_) => {
                if let Err(e) = run_git_command(
                    self.repo_path(),
                    &["worktree", "remove", "-f", &worktree_path],
                ) {
                    errs.push(e);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => errs.push(GitError::Other(format!(
                "failed to check worktree path: {e}"
            ))),
        }

        // If the repository itself is gone there is nothing more to clean up;
        // that is the desired end state.
        if !self.repo_path().join(".git").exists() {
            info!(
                "repository {} does not exist, cleanup already complete",
                self.repo_path().display()
            );
            return combine_errors(errs).map_or(Ok(()), Err);
        }

        let branch = self.branch_name().to_string();
        match branch_exists(self.repo_path(), &branch) {
            Ok(true) => match self.is_branch_checked_out() {
                Ok(true) => errs.push(GitError::BranchCheckedOut(branch.clone())),
                Ok(false) => {
                    if let Err(e) = run_git_command(self.repo_path(), &["branch", "-D", &branch]) {
                        errs.push(e);
                    }
                }
                Err(e) => errs.push(e),
            },
            Ok(false) => {}
            Err(e) => errs.push(e),
        }

        if let Err(e) = self.prune() {
            errs.push(e);
        }

        combine_errors(errs).map_or(Ok(()), Err)
    }

    /// Removes the worktree but keeps the branch. Used by pause.
    pub fn remove(&mut self) -> Result<(), GitError> {
        let worktree_path = self.worktree_path().to_string_lossy().into_owned();
        run_git_command(
            self.repo_path(),
            &["worktree", "remove", "-f", &worktree_path],
        )?;
        Ok(())
    }

    /// Removes administrative metadata for vanished worktrees.
    pub fn prune(&self) -> Result<(), GitError> {
        run_git_command(self.repo_path(), &["worktree", "prune"])?;
        Ok(())
    }

    /// True if this worktree's branch is checked out in any worktree of the
    /// repository other than this one.
    pub fn is_branch_checked_out(&self) -> Result<bool, GitError> {
        let output = run_git_command(self.repo_path(), &["worktree", "list", "--porcelain"])?;

        // git prints canonical paths; canonicalize ours for the comparison.
        let own_path = self
            .worktree_path()
            .canonicalize()
            .unwrap_or_else(|_| self.worktree_path().to_path_buf());

        let branch_ref = format!("refs/heads/{}", self.branch_name());
        let mut current_worktree: Option<&str> = None;
        for line in output.lines() {
            if let Some(path) = line.strip_prefix("worktree ") {
                current_worktree = Some(path);
            } else if let Some(branch) = line.strip_prefix("branch ") {
                if branch == branch_ref {
                    if let Some(path) = current_worktree {
                        let listed = Path::new(path)
                            .canonicalize()
                            .unwrap_or_else(|_| PathBuf::from(path));
                        if listed != own_path {
                            return Ok(true);
                        }
                    }
                }
            }
        }
        Ok(false)
    }

    /// Stages untracked files as intent-to-add and commits everything.
    pub fn commit_changes(&self, message: &str) -> Result<(), GitError> {
        run_git_command(self.worktree_path(), &["add", "-N", "."])?;
        // --no-gpg-sign avoids hanging on a GPG passphrase prompt in the
        // non-interactive worktree.
        run_git_command(
            self.worktree_path(),
            &["commit", "--no-gpg-sign", "-am", message],
        )?;
        Ok(())
    }

    /// Commits (optionally) and pushes the branch to the configured remote.
    pub fn push_changes(&self, message: &str, also_commit: bool) -> Result<(), GitError> {
        if also_commit {
            self.commit_changes(message)?;
        }
        let branch = self.branch_name().to_string();
        run_git_command(self.worktree_path(), &["push", "origin", &branch])?;
        Ok(())
    }

    /// Writes `.claude/settings.local.json` inside the worktree so git and gh
    /// commands run without interactive approval.
    fn create_claude_settings_file(&self) -> Result<(), GitError> {
        let claude_dir = self.worktree_path().join(".claude");
        fs::create_dir_all(&claude_dir).map_err(GitError::Io)?;

        let settings = ClaudeSettings {
            permissions: ClaudePermissions {
                allow: DEFAULT_ALLOWED_COMMANDS
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            },
        };
        let json = serde_json::to_string_pretty(&settings)
            .map_err(|e| GitError::Other(format!("failed to marshal settings: {e}")))?;

        fs::write(claude_dir.join("settings.local.json"), json).map_err(GitError::Io)?;

        // Keep the injected file out of diffs and pause commits.
        if let Err(e) = self.exclude_settings_from_git() {
            warn!("failed to exclude settings file from git: {e}");
        }
        Ok(())
    }

    /// Appends the settings file to the repository's local exclude list so it
    /// never shows up as a change on the instance branch.
    fn exclude_settings_from_git(&self) -> Result<(), GitError> {
        let output = run_git_command(self.worktree_path(), &["rev-parse", "--git-common-dir"])?;
        let common_dir = output.trim();
        let common_dir = if Path::new(common_dir).is_absolute() {
            PathBuf::from(common_dir)
        } else {
            self.worktree_path().join(common_dir)
        };

        const ENTRY: &str = ".claude/settings.local.json";
        let exclude_path = common_dir.join("info").join("exclude");
        let existing = fs::read_to_string(&exclude_path).unwrap_or_default();
        if existing.lines().any(|line| line.trim() == ENTRY) {
            return Ok(());
        }

        if let Some(parent) = exclude_path.parent() {
            fs::create_dir_all(parent).map_err(GitError::Io)?;
        }
        let mut content = existing;
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(ENTRY);
        content.push('\n');
        fs::write(&exclude_path, content).map_err(GitError::Io)
    }

    /// Finds the merge-base between this branch and the repository's default
    /// branch. Used when resuming onto an existing branch.
    fn compute_base_commit_sha(&mut self) -> Result<(), GitError> {
        let default_branch = self.find_default_branch()?;
        let branch = self.branch_name().to_string();
        let merge_base = run_git_command(
            self.repo_path(),
            &["merge-base", &branch, &default_branch],
        )?;
        self.set_base_commit_sha(merge_base.trim().to_string());
        Ok(())
    }

    /// The repository's default branch: remote HEAD symref, then main, then
    /// master.
    fn find_default_branch(&self) -> Result<String, GitError> {
        if let Ok(output) =
            run_git_command(self.repo_path(), &["symbolic-ref", "refs/remotes/origin/HEAD"])
        {
            if let Some(name) = output.trim().rsplit('/').next() {
                if !name.is_empty() {
                    return Ok(name.to_string());
                }
            }
        }

        for candidate in ["main", "master"] {
            if run_git_command(self.repo_path(), &["rev-parse", "--verify", candidate]).is_ok() {
                return Ok(candidate.to_string());
            }
        }

        Err(GitError::NoDefaultBranch)
    }

    fn set_base_commit_sha(&mut self, sha: String) {
        self.base_commit_sha = Some(sha);
    }
}

fn branch_exists(repo_path: &Path, branch: &str) -> Result<bool, GitError> {
    let branch_ref = format!("refs/heads/{branch}");
    match run_git_command(repo_path, &["rev-parse", "--verify", "--quiet", &branch_ref]) {
        Ok(_) => Ok(true),
        Err(GitError::CommandFailed { output, .. }) if output.is_empty() => Ok(false),
        // --quiet suppresses the error message; any output means a real failure.
        Err(e) => Err(e),
    }
}

/// Removes every worktree directory under the conventional prefix together
/// with its branch. Used only by the `reset` administrative command.
pub fn cleanup_worktrees() -> Result<(), GitError> {
    cleanup_worktrees_in(&get_worktree_directory()?)
}

/// As `cleanup_worktrees`, against an explicit worktrees directory.
pub fn cleanup_worktrees_in(worktrees_dir: &Path) -> Result<(), GitError> {
    let entries = match fs::read_dir(worktrees_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(GitError::Io(e)),
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }

        // Resolve the owning repository and branch from inside the worktree
        // before deleting anything.
        if let Some((repo_path, branch)) = resolve_worktree(&path, worktrees_dir) {
            let worktree_str = path.to_string_lossy().into_owned();
            if let Err(e) =
                run_git_command(&repo_path, &["worktree", "remove", "-f", &worktree_str])
            {
                warn!("failed to remove worktree {worktree_str}: {e}");
            }
            if let Some(branch) = branch {
                if let Err(e) = run_git_command(&repo_path, &["branch", "-D", &branch]) {
                    warn!("failed to delete branch {branch}: {e}");
                }
            }
            if let Err(e) = run_git_command(&repo_path, &["worktree", "prune"]) {
                warn!("failed to prune worktrees: {e}");
            }
        }

        // Remove whatever is left of the directory.
        if path.exists() {
            let _ = fs::remove_dir_all(&path);
        }
    }

    Ok(())
}

/// Given a worktree directory, returns its main repository path and checked
/// out branch by parsing `git worktree list --porcelain` from within.
fn resolve_worktree(worktree: &Path, worktrees_dir: &Path) -> Option<(PathBuf, Option<String>)> {
    let output = run_git_command(worktree, &["worktree", "list", "--porcelain"]).ok()?;

    let mut repo_path: Option<PathBuf> = None;
    let mut branch: Option<String> = None;
    let mut current: Option<&str> = None;

    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            current = Some(path);
            let candidate = Path::new(path);
            // The main repository is the first listed path that is not one of
            // our conventional worktrees.
            if repo_path.is_none() && candidate != worktree && !candidate.starts_with(worktrees_dir)
            {
                repo_path = Some(candidate.to_path_buf());
            }
        } else if let Some(branch_ref) = line.strip_prefix("branch ") {
            if current == Some(worktree.to_string_lossy().as_ref()) {
                branch = Some(
                    branch_ref
                        .strip_prefix("refs/heads/")
                        .unwrap_or(branch_ref)
                        .to_string(),
                );
            }
        }
    }

    repo_path.map(|repo| (repo, branch))
}
