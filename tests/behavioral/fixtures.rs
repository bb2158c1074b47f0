// ABOUTME: Shared fixtures: temporary git repositories driven by the real git CLI

#![allow(dead_code)]

use anyhow::{Context, Result};
use std::path::Path;
use std::process::Command;
use tempfile::TempDir;

/// A scratch git repository with one initial commit on `main`.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = TempDir::new()?;

        git(dir.path(), &["init", "-b", "main"])?;
        git(dir.path(), &["config", "user.email", "test@example.com"])?;
        git(dir.path(), &["config", "user.name", "Test User"])?;
        git(dir.path(), &["config", "commit.gpgsign", "false"])?;

        std::fs::write(dir.path().join("data.txt"), "one\ntwo\nthree\n")?;
        git(dir.path(), &["add", "."])?;
        git(dir.path(), &["commit", "-m", "initial commit"])?;

        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn head_sha(&self) -> Result<String> {
        Ok(git(self.path(), &["rev-parse", "HEAD"])?.trim().to_string())
    }

    pub fn branch_exists(&self, branch: &str) -> bool {
        git(
            self.path(),
            &["rev-parse", "--verify", &format!("refs/heads/{branch}")],
        )
        .is_ok()
    }

    /// Last commit subject on the given branch.
    pub fn last_commit_subject(&self, branch: &str) -> Result<String> {
        Ok(git(self.path(), &["log", "-1", "--format=%s", branch])?
            .trim()
            .to_string())
    }
}

/// Runs a git command in `dir`, returning stdout.
pub fn git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .current_dir(dir)
        .args(args)
        .output()
        .with_context(|| format!("failed to run git {args:?}"))?;
    if !output.status.success() {
        anyhow::bail!(
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
