// ABOUTME: Behavioral tests for worktree setup, pause/resume flows, and cleanup
// against real git repositories in temporary directories.

use anyhow::Result;
use tempfile::TempDir;

use claude_squad::git::GitWorktree;

use crate::fixtures::{git, TestRepo};

fn new_worktree(repo: &TestRepo, title: &str) -> Result<(GitWorktree, String, TempDir)> {
    let base = TempDir::new()?;
    let (worktree, branch) =
        GitWorktree::new_with_base_dir(repo.path(), title, "test/", base.path())?;
    Ok((worktree, branch, base))
}

#[test]
fn test_setup_creates_worktree_and_branch_from_head() -> Result<()> {
    // GIVEN: a repository with one commit
    let repo = TestRepo::new()?;
    let head = repo.head_sha()?;

    // WHEN: setting up a worktree for a fresh title
    let (mut worktree, branch, _base) = new_worktree(&repo, "alpha")?;
    worktree.setup()?;

    // THEN: the derived branch carries the prefix
    assert_eq!(branch, "test/alpha");
    assert!(repo.branch_exists("test/alpha"));

    // THEN: the worktree directory exists and is a linked worktree
    assert!(worktree.worktree_path().exists());
    assert!(worktree.worktree_path().join(".git").exists());
    assert!(worktree.worktree_path().join("data.txt").exists());

    // THEN: the base commit is the HEAD the branch was created from
    assert_eq!(worktree.base_commit_sha(), Some(head.as_str()));

    // THEN: the branch is checked out in exactly this worktree
    assert!(!worktree.is_branch_checked_out()?);

    Ok(())
}

#[test]
fn test_setup_writes_agent_settings_file() -> Result<()> {
    let repo = TestRepo::new()?;
    let (mut worktree, _, _base) = new_worktree(&repo, "alpha")?;
    worktree.setup()?;

    let settings_path = worktree.worktree_path().join(".claude/settings.local.json");
    assert!(settings_path.exists());

    let settings: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&settings_path)?)?;
    let allow = settings["permissions"]["allow"].as_array().unwrap();
    let allow: Vec<&str> = allow.iter().filter_map(|v| v.as_str()).collect();
    assert_eq!(allow, vec!["Bash(git:*)", "Bash(gh:*)"]);

    Ok(())
}

#[test]
fn test_worktree_path_is_unique_per_suffix() -> Result<()> {
    let repo = TestRepo::new()?;
    let base = TempDir::new()?;

    // Titles with a word suffix reuse it in the path
    let (worktree, _) =
        GitWorktree::new_with_base_dir(repo.path(), "alpha_amusing", "test/", base.path())?;
    let name = worktree
        .worktree_path()
        .file_name()
        .unwrap()
        .to_string_lossy()
        .into_owned();
    assert_eq!(name, "alpha_amusing_amusing");

    // Titles without one get a hex clock suffix
    let (worktree, _) =
        GitWorktree::new_with_base_dir(repo.path(), "alpha", "test/", base.path())?;
    let name = worktree
        .worktree_path()
        .file_name()
        .unwrap()
        .to_string_lossy()
        .into_owned();
    let suffix = name.rsplit('_').next().unwrap();
    assert_eq!(suffix.len(), 16);
    assert!(suffix.bytes().all(|b| b.is_ascii_hexdigit()));

    Ok(())
}

#[test]
fn test_pause_flow_removes_worktree_and_preserves_branch() -> Result<()> {
    // GIVEN: a set-up worktree with uncommitted work
    let repo = TestRepo::new()?;
    let (mut worktree, branch, _base) = new_worktree(&repo, "alpha")?;
    worktree.setup()?;
    std::fs::write(worktree.worktree_path().join("notes.md"), "work in progress\n")?;

    // WHEN: committing, removing the worktree, and pruning (the pause path)
    assert!(worktree.is_dirty()?);
    worktree.commit_changes("[claudesquad] update from 'alpha' on test run (paused)")?;
    worktree.remove()?;
    worktree.prune()?;

    // THEN: the directory is gone, the branch and commit survive
    assert!(!worktree.worktree_path().exists());
    assert!(repo.branch_exists(&branch));
    assert!(repo
        .last_commit_subject(&branch)?
        .starts_with("[claudesquad] update from 'alpha'"));

    Ok(())
}

#[test]
fn test_resume_flow_restores_committed_work() -> Result<()> {
    // GIVEN: a paused instance's branch with a committed file
    let repo = TestRepo::new()?;
    let initial_head = repo.head_sha()?;
    let (mut worktree, _, _base) = new_worktree(&repo, "alpha")?;
    worktree.setup()?;
    std::fs::write(worktree.worktree_path().join("notes.md"), "work in progress\n")?;
    worktree.commit_changes("[claudesquad] update from 'alpha' (paused)")?;
    worktree.remove()?;
    worktree.prune()?;

    // WHEN: setting up again (the resume path, existing branch)
    worktree.setup()?;

    // THEN: the worktree is back with the committed file, and clean
    assert!(worktree.worktree_path().exists());
    assert!(worktree.worktree_path().join("notes.md").exists());
    assert!(!worktree.is_dirty()?);

    // THEN: the base commit is the merge-base with the default branch
    assert_eq!(worktree.base_commit_sha(), Some(initial_head.as_str()));

    Ok(())
}

#[test]
fn test_cleanup_removes_worktree_and_branch() -> Result<()> {
    let repo = TestRepo::new()?;
    let (mut worktree, branch, _base) = new_worktree(&repo, "alpha")?;
    worktree.setup()?;

    worktree.cleanup()?;

    assert!(!worktree.worktree_path().exists());
    assert!(!repo.branch_exists(&branch));

    Ok(())
}

#[test]
fn test_cleanup_refuses_branch_checked_out_elsewhere() -> Result<()> {
    // GIVEN: a paused instance whose branch got checked out manually
    let repo = TestRepo::new()?;
    let (mut worktree, branch, _base) = new_worktree(&repo, "beta")?;
    worktree.setup()?;
    worktree.remove()?;
    worktree.prune()?;

    let elsewhere = TempDir::new()?;
    let elsewhere_path = elsewhere.path().join("manual");
    git(
        repo.path(),
        &[
            "worktree",
            "add",
            elsewhere_path.to_str().unwrap(),
            &branch,
        ],
    )?;

    // WHEN: killing the instance
    let err = worktree.cleanup().unwrap_err();

    // THEN: the failure names the conflict and the branch survives
    assert!(
        err.to_string().contains("currently checked out"),
        "got: {err}"
    );
    assert!(repo.branch_exists(&branch));

    Ok(())
}

#[test]
fn test_cleanup_is_tolerant_of_missing_resources() -> Result<()> {
    let repo = TestRepo::new()?;
    let (mut worktree, _, _base) = new_worktree(&repo, "alpha")?;
    worktree.setup()?;

    // Cleaning up twice: the second pass finds nothing and still succeeds.
    worktree.cleanup()?;
    worktree.cleanup()?;

    Ok(())
}

#[test]
fn test_is_branch_checked_out_detects_other_worktrees() -> Result<()> {
    let repo = TestRepo::new()?;
    let (mut worktree, branch, _base) = new_worktree(&repo, "gamma")?;
    worktree.setup()?;
    worktree.remove()?;
    worktree.prune()?;

    assert!(!worktree.is_branch_checked_out()?);

    let elsewhere = TempDir::new()?;
    let elsewhere_path = elsewhere.path().join("manual");
    git(
        repo.path(),
        &[
            "worktree",
            "add",
            elsewhere_path.to_str().unwrap(),
            &branch,
        ],
    )?;

    assert!(worktree.is_branch_checked_out()?);

    Ok(())
}
