// ABOUTME: Behavioral tests for instance persistence through the state store

use anyhow::Result;
use chrono::Utc;
use std::path::PathBuf;
use tempfile::TempDir;

use claude_squad::config::{SessionType, State};
use claude_squad::session::storage::{DiffStatsData, GitWorktreeData};
use claude_squad::session::{InstanceData, Status, Storage};

fn paused_record(title: &str) -> InstanceData {
    InstanceData {
        title: title.to_string(),
        path: PathBuf::from("/repo"),
        branch: format!("user/{title}"),
        status: Status::Paused,
        height: 24,
        width: 80,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        last_opened_at: None,
        auto_yes: false,
        archived: false,
        program: "claude".to_string(),
        worktree: Some(GitWorktreeData {
            repo_path: PathBuf::from("/repo"),
            worktree_path: PathBuf::from(format!("/worktrees/{title}_18840af3cf6904f0")),
            session_name: title.to_string(),
            branch_name: format!("user/{title}"),
            base_commit_sha: "abc123".to_string(),
        }),
        diff_stats: Some(DiffStatsData {
            added: 2,
            removed: 1,
            content: "+a\n+b\n-c\n".to_string(),
        }),
        summary: "idle".to_string(),
        summary_updated_at: None,
        claude_session_id: "session-xyz".to_string(),
        session_type: Some(SessionType::Zellij),
        docker_container_id: String::new(),
        docker_repo_url: String::new(),
        docker_base_image: String::new(),
    }
}

fn storage_in(dir: &TempDir) -> Storage {
    Storage::new(State::load_from_dir(dir.path()))
}

#[tokio::test]
async fn test_persist_and_reload_round_trip() -> Result<()> {
    let dir = TempDir::new()?;

    // GIVEN: a stored record
    {
        let mut storage = storage_in(&dir);
        let json = serde_json::to_value(vec![paused_record("alpha")])?;
        storage.state_mut().save_instances(json)?;
    }

    // WHEN: a fresh process loads, then saves, then loads again
    let mut storage = storage_in(&dir);
    let instances = storage.load_instances().await?;
    assert_eq!(instances.len(), 1);
    storage.save_instances(&instances).await?;

    let reloaded = storage.load_instances().await?;
    assert_eq!(reloaded.len(), 1);

    // THEN: the persisted fields survive the round trip
    let instance = reloaded[0].lock().await;
    assert_eq!(instance.title, "alpha");
    assert_eq!(instance.branch, "user/alpha");
    assert_eq!(instance.status, Status::Paused);
    assert_eq!(instance.claude_session_id, "session-xyz");
    assert_eq!(instance.session_type, SessionType::Zellij);
    let worktree = instance.git_worktree().unwrap();
    assert_eq!(worktree.base_commit_sha(), Some("abc123"));
    let stats = instance.diff_stats().unwrap();
    assert_eq!((stats.added, stats.removed), (2, 1));

    Ok(())
}

#[tokio::test]
async fn test_duplicate_titles_are_dropped_on_save() -> Result<()> {
    let dir = TempDir::new()?;
    let mut storage = storage_in(&dir);

    let json = serde_json::to_value(vec![
        paused_record("alpha"),
        paused_record("alpha"),
        paused_record("beta"),
    ])?;
    storage.state_mut().save_instances(json)?;

    let instances = storage.load_instances().await?;
    assert_eq!(instances.len(), 3);

    // Saving deduplicates; the next load sees one record per title.
    storage.save_instances(&instances).await?;
    let reloaded = storage.load_instances().await?;
    assert_eq!(reloaded.len(), 2);

    Ok(())
}

#[tokio::test]
async fn test_cross_process_sync_via_mtime() -> Result<()> {
    let dir = TempDir::new()?;

    let mut foreground = storage_in(&dir);
    assert_eq!(foreground.load_instances().await?.len(), 0);

    // Another process (the daemon) writes a new instance list.
    std::thread::sleep(std::time::Duration::from_millis(50));
    {
        let mut daemon = storage_in(&dir);
        let json = serde_json::to_value(vec![paused_record("from-daemon")])?;
        daemon.state_mut().save_instances(json)?;
    }

    // The foreground picks it up through the mtime watermark.
    let (synced, refreshed) = foreground.sync_from_disk().await?;
    assert!(refreshed);
    assert_eq!(synced.len(), 1);
    assert_eq!(synced[0].lock().await.title, "from-daemon");

    // A second sync with no intervening write is a no-op.
    let (_, refreshed) = foreground.sync_from_disk().await?;
    assert!(!refreshed);

    Ok(())
}

#[tokio::test]
async fn test_legacy_record_without_session_type() -> Result<()> {
    let dir = TempDir::new()?;
    let mut storage = storage_in(&dir);

    // A record written before session types existed.
    let legacy = serde_json::json!([{
        "title": "legacy",
        "path": "/repo",
        "status": 3,
        "created_at": "2024-06-01T00:00:00Z",
        "updated_at": "2024-06-01T00:00:00Z",
        "program": "claude",
        "worktree": {
            "repo_path": "/repo",
            "worktree_path": "/worktrees/legacy_18840af3cf6904f0",
            "session_name": "legacy",
            "branch_name": "user/legacy",
            "base_commit_sha": ""
        }
    }]);
    storage.state_mut().save_instances(legacy)?;

    let instances = storage.load_instances().await?;
    assert_eq!(instances.len(), 1);
    assert_eq!(
        instances[0].lock().await.session_type,
        SessionType::Zellij
    );

    Ok(())
}
