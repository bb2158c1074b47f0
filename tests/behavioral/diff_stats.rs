// ABOUTME: Behavioral tests for diff computation and caching against real repos

use anyhow::Result;
use tempfile::TempDir;

use claude_squad::git::diff::BASE_COMMIT_UNSET;
use claude_squad::git::GitWorktree;

use crate::fixtures::TestRepo;

fn set_up_worktree(repo: &TestRepo) -> Result<(GitWorktree, TempDir)> {
    let base = TempDir::new()?;
    let (mut worktree, _) =
        GitWorktree::new_with_base_dir(repo.path(), "difftest", "test/", base.path())?;
    worktree.setup()?;
    Ok((worktree, base))
}

#[test]
fn test_added_lines_are_counted() -> Result<()> {
    // GIVEN: a fresh worktree based at HEAD
    let repo = TestRepo::new()?;
    let (mut worktree, _base) = set_up_worktree(&repo)?;

    // WHEN: adding a new three-line file
    std::fs::write(
        worktree.worktree_path().join("feature.txt"),
        "alpha\nbeta\ngamma\n",
    )?;
    let stats = worktree.diff();

    // THEN: three additions, no removals, a unified diff header
    assert!(stats.error.is_none(), "unexpected error: {:?}", stats.error);
    assert_eq!(stats.added, 3);
    assert_eq!(stats.removed, 0);
    assert!(stats.content.contains("diff --git"));
    assert!(stats.content.contains("feature.txt"));

    Ok(())
}

#[test]
fn test_removed_lines_are_counted() -> Result<()> {
    let repo = TestRepo::new()?;
    let (mut worktree, _base) = set_up_worktree(&repo)?;

    // Delete one committed line from data.txt ("one\ntwo\nthree\n").
    std::fs::write(worktree.worktree_path().join("data.txt"), "one\ntwo\n")?;
    let stats = worktree.diff();

    assert!(stats.error.is_none());
    assert_eq!(stats.added, 0);
    assert_eq!(stats.removed, 1);

    Ok(())
}

#[test]
fn test_diff_results_are_cached_within_window() -> Result<()> {
    let repo = TestRepo::new()?;
    let (mut worktree, _base) = set_up_worktree(&repo)?;

    std::fs::write(
        worktree.worktree_path().join("feature.txt"),
        "alpha\nbeta\ngamma\n",
    )?;
    let first = worktree.diff();
    assert_eq!(first.added, 3);

    // A new change inside the cache window is not observed yet.
    std::fs::write(
        worktree.worktree_path().join("feature.txt"),
        "alpha\nbeta\ngamma\ndelta\n",
    )?;
    let second = worktree.diff();
    assert_eq!(second.added, 3, "second call should serve the cached stats");

    // An explicit invalidation forces a fresh computation.
    worktree.invalidate_diff_cache();
    let third = worktree.diff();
    assert_eq!(third.added, 4);

    Ok(())
}

#[test]
fn test_missing_base_commit_is_not_ready_rather_than_error() -> Result<()> {
    // A worktree descriptor reloaded without a base commit defers diffs.
    let repo = TestRepo::new()?;
    let mut worktree = GitWorktree::from_storage(
        repo.path().to_path_buf(),
        repo.path().to_path_buf(),
        "difftest".to_string(),
        "test/difftest".to_string(),
        None,
    );

    let stats = worktree.diff();
    assert_eq!(stats.error.as_deref(), Some(BASE_COMMIT_UNSET));
    assert_eq!(stats.added, 0);
    assert_eq!(stats.removed, 0);

    Ok(())
}
