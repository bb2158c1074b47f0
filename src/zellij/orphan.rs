// ABOUTME: Recovery of zellij sessions whose owning instance record was lost
//
// Sessions survive a crash of the foreground process. This module enumerates
// live sessions bearing the product prefix that are absent from the store and
// reconstructs enough metadata from `dump-layout` to re-adopt them.

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashSet;
use std::path::Path;
use tokio::process::Command;

use super::{strip_ansi_codes, ZELLIJ_PREFIX};

lazy_static! {
    // Worktree directories are named <branch>_<16 hex chars of nanos>.
    static ref BRANCH_SUFFIX_RE: Regex = Regex::new(r"^(.+)_[0-9a-f]{16}$").unwrap();
}

/// A zellij session not tracked in the persisted state.
#[derive(Debug, Clone, Default)]
pub struct OrphanedSession {
    /// Full session name, e.g. "claudesquad_MyTask".
    pub session_name: String,
    /// Title with the product prefix removed.
    pub title: String,
    /// Working directory recovered from the session layout.
    pub worktree_path: String,
    /// Program command recovered from the session layout.
    pub program: String,
    /// Branch name derived from the worktree path convention.
    pub branch_name: String,
    /// Original repository path recovered via `git worktree list`.
    pub repo_path: String,
}

/// Lists live prefix-bearing sessions whose titles are not in `tracked_titles`.
pub async fn list_orphaned_sessions(tracked_titles: &[String]) -> Result<Vec<OrphanedSession>> {
    let output = Command::new("zellij")
        .arg("list-sessions")
        .output()
        .await
        .context("failed to list zellij sessions")?;
    if !output.status.success() {
        anyhow::bail!(
            "failed to list zellij sessions: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let clean_output = strip_ansi_codes(&String::from_utf8_lossy(&output.stdout));
    let tracked: HashSet<&str> = tracked_titles.iter().map(String::as_str).collect();

    let mut orphans = Vec::new();
    for line in clean_output.lines() {
        let line = line.trim();
        if line.is_empty() || line.contains("EXITED") {
            continue;
        }

        let Some(session_name) = line.split_whitespace().next() else {
            continue;
        };
        let Some(title) = session_name.strip_prefix(ZELLIJ_PREFIX) else {
            continue;
        };
        if tracked.contains(title) {
            continue;
        }

        orphans.push(OrphanedSession {
            session_name: session_name.to_string(),
            title: title.to_string(),
            ..Default::default()
        });
    }

    Ok(orphans)
}

/// Recovers working directory, program, branch and repository path for an
/// orphaned session by inspecting its layout.
pub async fn recover_metadata(session_name: &str) -> Result<OrphanedSession> {
    let output = Command::new("zellij")
        .args(["-s", session_name, "action", "dump-layout"])
        .output()
        .await
        .with_context(|| format!("failed to dump layout for session {session_name}"))?;
    if !output.status.success() {
        anyhow::bail!(
            "failed to dump layout for session {session_name}: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let layout = String::from_utf8_lossy(&output.stdout).into_owned();
    let cwd = extract_kdl_value(&layout, "cwd").unwrap_or_default();
    let program = extract_kdl_value(&layout, "command").unwrap_or_default();
    let title = session_name
        .strip_prefix(ZELLIJ_PREFIX)
        .unwrap_or(session_name)
        .to_string();

    let mut orphan = OrphanedSession {
        session_name: session_name.to_string(),
        title,
        worktree_path: cwd.clone(),
        program,
        ..Default::default()
    };

    // Only conventional worktree paths carry a derivable branch name.
    if !cwd.is_empty() && cwd.contains(".claude-squad/worktrees/") {
        orphan.branch_name = extract_branch_from_worktree_path(&cwd).unwrap_or_default();
        orphan.repo_path = repo_path_from_worktree(&cwd).await.unwrap_or_default();
    }

    Ok(orphan)
}

/// Extracts `key "value"` from KDL layout content.
fn extract_kdl_value(content: &str, key: &str) -> Option<String> {
    let pattern = Regex::new(&format!(r#"{}\s+"([^"]+)""#, regex::escape(key))).ok()?;
    pattern
        .captures(content)
        .map(|captures| captures[1].to_string())
}

/// Derives the branch name from a worktree path following the
/// `<branch>_<16 hex chars>` convention.
fn extract_branch_from_worktree_path(worktree_path: &str) -> Option<String> {
    let base = Path::new(worktree_path).file_name()?.to_str()?;
    BRANCH_SUFFIX_RE
        .captures(base)
        .map(|captures| captures[1].to_string())
}

/// Finds the original repository path from inside a linked worktree: the
/// first entry of `git worktree list` that is neither this worktree nor
/// another conventional worktree.
async fn repo_path_from_worktree(worktree_path: &str) -> Option<String> {
    let output = Command::new("git")
        .args(["-C", worktree_path, "worktree", "list", "--porcelain"])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }

    let listing = String::from_utf8_lossy(&output.stdout).into_owned();
    for line in listing.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if path != worktree_path && !path.contains(".claude-squad/worktrees/") {
                return Some(path.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_kdl_value() {
        let layout = r#"layout {
    pane {
        cwd "/home/user/.claude-squad/worktrees/user/fix_18840cf732e4c550"
        command "sh"
        args "-c" "claude"
    }
}"#;
        assert_eq!(
            extract_kdl_value(layout, "cwd").as_deref(),
            Some("/home/user/.claude-squad/worktrees/user/fix_18840cf732e4c550")
        );
        assert_eq!(extract_kdl_value(layout, "command").as_deref(), Some("sh"));
        assert_eq!(extract_kdl_value(layout, "missing"), None);
    }

    #[test]
    fn test_extract_branch_from_worktree_path() {
        assert_eq!(
            extract_branch_from_worktree_path(
                "/home/u/.claude-squad/worktrees/colors_18840af3cf6904f0"
            )
            .as_deref(),
            Some("colors")
        );
        // Underscores inside the branch name are preserved
        assert_eq!(
            extract_branch_from_worktree_path(
                "/home/u/.claude-squad/worktrees/fix_bug_18840af3cf6904f0"
            )
            .as_deref(),
            Some("fix_bug")
        );
        // Suffix must be exactly 16 hex characters
        assert_eq!(
            extract_branch_from_worktree_path("/home/u/.claude-squad/worktrees/colors_amusing"),
            None
        );
        assert_eq!(
            extract_branch_from_worktree_path("/home/u/.claude-squad/worktrees/colors"),
            None
        );
    }
}
