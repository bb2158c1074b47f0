// ABOUTME: Diff statistics against the worktree's base commit, with caching

use std::time::{Duration, Instant};

use super::util::run_git_command;
use super::GitWorktree;

/// How long diff results are reused before re-running git.
pub(crate) const DEFAULT_DIFF_CACHE_DURATION: Duration = Duration::from_secs(5);

/// Message placed in `DiffStats::error` when the base commit is unknown.
/// The refresh pipeline treats this as "not ready yet", not a failure.
pub const BASE_COMMIT_UNSET: &str = "base commit SHA not set";

/// Statistics about the changes in a diff.
#[derive(Debug, Clone, Default)]
pub struct DiffStats {
    /// The full unified diff content.
    pub content: String,
    /// Number of added lines.
    pub added: usize,
    /// Number of removed lines.
    pub removed: usize,
    /// Error that occurred during diff computation, carried in-band so setup
    /// states like a missing base commit do not break the caller's flow.
    pub error: Option<String>,
}

impl DiffStats {
    pub fn is_empty(&self) -> bool {
        self.added == 0 && self.removed == 0 && self.content.is_empty()
    }
}

impl GitWorktree {
    /// Quick check for uncommitted changes. Much faster than a full diff.
    pub fn is_dirty(&self) -> Result<bool, super::GitError> {
        let output = run_git_command(&self.worktree_path, &["status", "--porcelain"])?;
        Ok(!output.trim().is_empty())
    }

    /// Returns the diff between the worktree and the base commit along with
    /// statistics. Results are cached for up to 5 seconds.
    pub fn diff(&mut self) -> DiffStats {
        if let (Some(cached), Some(cache_time)) = (&self.cached_diff_stats, self.diff_cache_time) {
            if cache_time.elapsed() < self.diff_cache_duration {
                if cached.is_empty() {
                    // An empty result stays valid only while the tree is clean.
                    if let Ok(false) = self.is_dirty() {
                        return self.cached_diff_stats.clone().unwrap();
                    }
                } else {
                    return cached.clone();
                }
            }
        }

        let stats = self.diff_uncached();
        self.cached_diff_stats = Some(stats.clone());
        self.diff_cache_time = Some(Instant::now());
        stats
    }

    fn diff_uncached(&self) -> DiffStats {
        let mut stats = DiffStats::default();

        let Some(base) = self.base_commit_sha() else {
            stats.error = Some(BASE_COMMIT_UNSET.to_string());
            return stats;
        };
        let base = base.to_string();

        // -N stages untracked files (intent to add) so they show up in the diff.
        if let Err(e) = run_git_command(&self.worktree_path, &["add", "-N", "."]) {
            stats.error = Some(e.to_string());
            return stats;
        }

        let content = match run_git_command(&self.worktree_path, &["--no-pager", "diff", &base]) {
            Ok(content) => content,
            Err(e) => {
                stats.error = Some(e.to_string());
                return stats;
            }
        };

        for line in content.lines() {
            if line.starts_with('+') && !line.starts_with("+++") {
                stats.added += 1;
            } else if line.starts_with('-') && !line.starts_with("---") {
                stats.removed += 1;
            }
        }
        stats.content = content;

        stats
    }

    /// Clears the cached diff stats, forcing the next `diff` call to run git
    /// again. Call after operations known to change the worktree, e.g. resume.
    pub fn invalidate_diff_cache(&mut self) {
        self.cached_diff_stats = None;
        self.diff_cache_time = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_diff_without_base_commit_reports_not_ready() {
        let mut worktree = GitWorktree::from_storage(
            PathBuf::from("/nonexistent/repo"),
            PathBuf::from("/nonexistent/worktree"),
            "task".to_string(),
            "user/task".to_string(),
            None,
        );

        let stats = worktree.diff();
        assert_eq!(stats.error.as_deref(), Some(BASE_COMMIT_UNSET));
        assert_eq!(stats.added, 0);
        assert_eq!(stats.removed, 0);
    }

    #[test]
    fn test_diff_stats_is_empty() {
        assert!(DiffStats::default().is_empty());
        let stats = DiffStats {
            added: 1,
            ..Default::default()
        };
        assert!(!stats.is_empty());
    }
}
