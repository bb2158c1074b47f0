// ABOUTME: Serialization of instances to persisted records and back
//
// The store round-trips an opaque JSON array through the state file. Records
// are flat objects with defaulted fields so state written by older versions
// keeps loading.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{new_multiplexer, Instance, MultiplexerOptions, Status};
use crate::config::{SessionType, State};
use crate::git::{DiffStats, GitWorktree};

/// The serializable projection of an `Instance`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceData {
    pub title: String,
    pub path: PathBuf,
    #[serde(default)]
    pub branch: String,
    pub status: Status,
    #[serde(default)]
    pub height: u16,
    #[serde(default)]
    pub width: u16,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_opened_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub auto_yes: bool,
    #[serde(default)]
    pub archived: bool,

    pub program: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree: Option<GitWorktreeData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_stats: Option<DiffStatsData>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_updated_at: Option<DateTime<Utc>>,

    /// Agent session ID for resuming conversations after restart.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub claude_session_id: String,

    /// Absent in records written by older versions; defaults to local-mux.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_type: Option<SessionType>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub docker_container_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub docker_repo_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub docker_base_image: String,
}

/// The serializable projection of a `GitWorktree`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitWorktreeData {
    pub repo_path: PathBuf,
    pub worktree_path: PathBuf,
    pub session_name: String,
    pub branch_name: String,
    #[serde(default)]
    pub base_commit_sha: String,
}

/// The serializable projection of `DiffStats`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiffStatsData {
    #[serde(default)]
    pub added: usize,
    #[serde(default)]
    pub removed: usize,
    #[serde(default)]
    pub content: String,
}

impl Instance {
    /// Converts the instance to its serializable form.
    pub fn to_instance_data(&self) -> InstanceData {
        InstanceData {
            title: self.title.clone(),
            path: self.path.clone(),
            branch: self.branch.clone(),
            status: self.status,
            height: self.height,
            width: self.width,
            created_at: self.created_at,
            updated_at: Utc::now(),
            last_opened_at: self.last_opened_at,
            auto_yes: self.auto_yes,
            archived: self.archived,
            program: self.program.clone(),
            worktree: self.git_worktree().map(|worktree| GitWorktreeData {
                repo_path: worktree.repo_path().to_path_buf(),
                worktree_path: worktree.worktree_path().to_path_buf(),
                session_name: worktree.session_name().to_string(),
                branch_name: worktree.branch_name().to_string(),
                base_commit_sha: worktree.base_commit_sha().unwrap_or_default().to_string(),
            }),
            diff_stats: self.diff_stats().map(|stats| DiffStatsData {
                added: stats.added,
                removed: stats.removed,
                content: stats.content.clone(),
            }),
            summary: self.summary.clone(),
            summary_updated_at: self.summary_updated_at,
            claude_session_id: self.claude_session_id.clone(),
            session_type: Some(self.session_type),
            docker_container_id: self.docker_container_id.clone(),
            docker_repo_url: self.docker_repo_url.clone(),
            docker_base_image: self.docker_base_image.clone(),
        }
    }

    /// Reconstructs an instance from its serialized form.
    ///
    /// Paused and archived instances come back with a lazily-created backend
    /// handle; anything else restores its live session immediately.
    pub async fn from_instance_data(data: InstanceData) -> Result<Self> {
        let session_type = data.session_type.unwrap_or_default();

        let git_worktree = data
            .worktree
            .as_ref()
            .filter(|worktree| !worktree.worktree_path.as_os_str().is_empty())
            .map(|worktree| {
                GitWorktree::from_storage(
                    worktree.repo_path.clone(),
                    worktree.worktree_path.clone(),
                    worktree.session_name.clone(),
                    worktree.branch_name.clone(),
                    if worktree.base_commit_sha.is_empty() {
                        None
                    } else {
                        Some(worktree.base_commit_sha.clone())
                    },
                )
            });

        let mut instance = Instance {
            title: data.title,
            path: data.path,
            branch: data.branch,
            status: data.status,
            program: data.program,
            height: data.height,
            width: data.width,
            created_at: data.created_at,
            updated_at: data.updated_at,
            last_opened_at: data.last_opened_at,
            auto_yes: data.auto_yes,
            prompt: String::new(),
            archived: data.archived,
            summary: data.summary,
            summary_updated_at: data.summary_updated_at,
            claude_session_id: data.claude_session_id,
            session_type,
            docker_container_id: data.docker_container_id,
            docker_repo_url: data.docker_repo_url,
            docker_base_image: data.docker_base_image,
            diff_stats: data.diff_stats.map(|stats| DiffStats {
                added: stats.added,
                removed: stats.removed,
                content: stats.content,
                error: None,
            }),
            last_diff_update: None,
            last_activity: None,
            started: false,
            session: None,
            git_worktree,
        };

        if instance.paused() || instance.archived {
            // No live resources to reattach; the handle is created lazily so
            // resume can start or restore it later.
            let session_name = instance
                .git_worktree()
                .map(|worktree| worktree.session_name().to_string())
                .unwrap_or_else(|| instance.title.clone());
            instance.session = Some(new_multiplexer(
                session_type,
                &session_name,
                &instance.program,
                MultiplexerOptions {
                    base_image: instance.docker_base_image.clone(),
                    repo_url: instance.docker_repo_url.clone(),
                    branch_name: instance.branch.clone(),
                    work_dir: String::new(),
                },
            ));
            instance.started = true;
        } else {
            instance.start(false).await?;
        }

        Ok(instance)
    }
}

/// Handles saving and loading instances through the state store.
pub struct Storage {
    state: State,
}

impl Storage {
    pub fn new(state: State) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut State {
        &mut self.state
    }

    /// Saves the list of instances to disk.
    ///
    /// Unstarted instances are not persisted. Duplicate titles are dropped,
    /// keeping only the first record for each.
    pub async fn save_instances(&mut self, instances: &[Arc<Mutex<Instance>>]) -> Result<()> {
        let mut data: Vec<InstanceData> = Vec::with_capacity(instances.len());
        let mut seen_titles: HashSet<String> = HashSet::new();

        for instance in instances {
            let instance = instance.lock().await;
            if !instance.started() {
                continue;
            }
            let record = instance.to_instance_data();
            if !seen_titles.insert(record.title.clone()) {
                warn!("skipping duplicate instance when saving: {}", record.title);
                continue;
            }
            data.push(record);
        }

        let json = serde_json::to_value(&data).context("failed to marshal instances")?;
        self.state.save_instances(json)
    }

    /// Loads the list of instances from disk.
    ///
    /// Records that can no longer be materialized (for example because their
    /// backend session is gone) are filtered out, and the cleaned state is
    /// written back.
    pub async fn load_instances(&mut self) -> Result<Vec<Arc<Mutex<Instance>>>> {
        let records: Vec<InstanceData> =
            serde_json::from_value(self.state.get_instances().clone())
                .context("failed to unmarshal instances")?;

        let mut instances = Vec::with_capacity(records.len());
        let mut skipped = 0usize;
        for record in records {
            let title = record.title.clone();
            match Instance::from_instance_data(record).await {
                Ok(instance) => instances.push(Arc::new(Mutex::new(instance))),
                Err(e) => {
                    warn!("skipping invalid instance {title:?}: {e:#}");
                    skipped += 1;
                }
            }
        }

        if skipped > 0 {
            info!("removed {skipped} invalid instance(s) from state");
            if let Err(e) = self.save_instances(&instances).await {
                warn!("failed to save cleaned state: {e:#}");
            }
        }

        Ok(instances)
    }

    /// Removes one instance from storage by title.
    pub fn delete_instance(&mut self, title: &str) -> Result<()> {
        let mut records: Vec<InstanceData> =
            serde_json::from_value(self.state.get_instances().clone())
                .context("failed to unmarshal instances")?;

        let before = records.len();
        records.retain(|record| record.title != title);
        if records.len() == before {
            anyhow::bail!("instance not found: {title}");
        }

        let json = serde_json::to_value(&records).context("failed to marshal instances")?;
        self.state.save_instances(json)
    }

    /// Updates a single instance's record in place.
    pub async fn update_instance(&mut self, instance: &Arc<Mutex<Instance>>) -> Result<()> {
        let record = {
            let instance = instance.lock().await;
            instance.to_instance_data()
        };

        let mut records: Vec<InstanceData> =
            serde_json::from_value(self.state.get_instances().clone())
                .context("failed to unmarshal instances")?;

        let Some(slot) = records.iter_mut().find(|r| r.title == record.title) else {
            anyhow::bail!("instance not found: {}", record.title);
        };
        *slot = record;

        let json = serde_json::to_value(&records).context("failed to marshal instances")?;
        self.state.save_instances(json)
    }

    /// Sets the archived flag on a stored record.
    pub fn set_instance_archived(&mut self, title: &str, archived: bool) -> Result<()> {
        let mut records: Vec<InstanceData> =
            serde_json::from_value(self.state.get_instances().clone())
                .context("failed to unmarshal instances")?;

        let Some(record) = records.iter_mut().find(|r| r.title == title) else {
            anyhow::bail!("instance not found: {title}");
        };
        record.archived = archived;

        let json = serde_json::to_value(&records).context("failed to marshal instances")?;
        self.state.save_instances(json)
    }

    /// Removes all stored instances.
    pub fn delete_all_instances(&mut self) -> Result<()> {
        self.state.delete_all_instances()
    }

    /// Checks whether another process has written the state file and reloads
    /// instances if so. Returns the reloaded instances and whether a sync
    /// occurred; the caller merges them with its in-memory list.
    pub async fn sync_from_disk(&mut self) -> Result<(Vec<Arc<Mutex<Instance>>>, bool)> {
        let refreshed = self
            .state
            .refresh_from_disk()
            .context("failed to refresh state from disk")?;
        if !refreshed {
            return Ok((Vec::new(), false));
        }

        info!("state file changed, reloading instances from disk");
        let instances = self
            .load_instances()
            .await
            .context("failed to load instances after refresh")?;
        Ok((instances, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::InstanceOptions;
    use tempfile::TempDir;

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
            auto_yes: true,
            archived: false,
            program: "claude".to_string(),
            worktree: Some(GitWorktreeData {
                repo_path: PathBuf::from("/repo"),
                worktree_path: PathBuf::from("/worktrees/x"),
                session_name: title.to_string(),
                branch_name: format!("user/{title}"),
                base_commit_sha: "abc123".to_string(),
            }),
            diff_stats: Some(DiffStatsData {
                added: 3,
                removed: 1,
                content: "+x\n".to_string(),
            }),
            summary: "working".to_string(),
            summary_updated_at: Some(Utc::now()),
            claude_session_id: "sess-1".to_string(),
            session_type: Some(SessionType::Zellij),
            docker_container_id: String::new(),
            docker_repo_url: String::new(),
            docker_base_image: String::new(),
        }
    }

    #[tokio::test]
    async fn test_record_round_trip_is_fixed_point() {
        let record = paused_record("alpha");
        let instance = Instance::from_instance_data(record.clone()).await.unwrap();
        let round_tripped = instance.to_instance_data();

        assert_eq!(round_tripped.title, record.title);
        assert_eq!(round_tripped.path, record.path);
        assert_eq!(round_tripped.branch, record.branch);
        assert_eq!(round_tripped.status, record.status);
        assert_eq!(round_tripped.auto_yes, record.auto_yes);
        assert_eq!(round_tripped.archived, record.archived);
        assert_eq!(round_tripped.program, record.program);
        assert_eq!(round_tripped.summary, record.summary);
        assert_eq!(round_tripped.claude_session_id, record.claude_session_id);
        assert_eq!(round_tripped.session_type, record.session_type);

        let wt = round_tripped.worktree.as_ref().unwrap();
        let orig_wt = record.worktree.as_ref().unwrap();
        assert_eq!(wt.worktree_path, orig_wt.worktree_path);
        assert_eq!(wt.branch_name, orig_wt.branch_name);
        assert_eq!(wt.base_commit_sha, orig_wt.base_commit_sha);

        let diff = round_tripped.diff_stats.as_ref().unwrap();
        assert_eq!(diff.added, 3);
        assert_eq!(diff.removed, 1);
    }

    #[tokio::test]
    async fn test_paused_instance_loads_lazily() {
        let instance = Instance::from_instance_data(paused_record("alpha"))
            .await
            .unwrap();
        assert!(instance.started());
        assert!(instance.paused());
    }

    #[test]
    fn test_missing_session_type_defaults_to_zellij() {
        let json = serde_json::json!({
            "title": "old",
            "path": "/repo",
            "status": 3,
            "created_at": "2024-01-01T00:00:00Z",
            "updated_at": "2024-01-01T00:00:00Z",
            "program": "claude"
        });
        let record: InstanceData = serde_json::from_value(json).unwrap();
        assert!(record.session_type.is_none());
        assert_eq!(record.session_type.unwrap_or_default(), SessionType::Zellij);
    }

    #[tokio::test]
    async fn test_save_skips_unstarted_and_dedups_titles() {
        let dir = TempDir::new().unwrap();
        let mut storage = Storage::new(State::load_from_dir(dir.path()));

        let make = |title: &str, started: bool| {
            let mut instance = Instance::new(InstanceOptions {
                title: title.to_string(),
                path: PathBuf::from("."),
                program: "claude".to_string(),
                ..Default::default()
            })
            .unwrap();
            if started {
                instance.mark_started();
                instance.status = Status::Paused;
            }
            Arc::new(Mutex::new(instance))
        };

        let instances = vec![
            make("alpha", true),
            make("alpha", true),
            make("beta", false),
            make("gamma", true),
        ];
        storage.save_instances(&instances).await.unwrap();

        let records: Vec<InstanceData> =
            serde_json::from_value(storage.state().get_instances().clone()).unwrap();
        let titles: Vec<&str> = records.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, vec!["alpha", "gamma"]);
    }

    #[tokio::test]
    async fn test_delete_instance() {
        let dir = TempDir::new().unwrap();
        let mut storage = Storage::new(State::load_from_dir(dir.path()));

        let json = serde_json::to_value(vec![paused_record("alpha"), paused_record("beta")])
            .unwrap();
        storage.state_mut().save_instances(json).unwrap();

        storage.delete_instance("alpha").unwrap();
        let records: Vec<InstanceData> =
            serde_json::from_value(storage.state().get_instances().clone()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].title, "beta");

        assert!(storage.delete_instance("missing").is_err());
    }

    #[tokio::test]
    async fn test_archive_flag_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut storage = Storage::new(State::load_from_dir(dir.path()));

        let json = serde_json::to_value(vec![paused_record("alpha")]).unwrap();
        storage.state_mut().save_instances(json).unwrap();

        storage.set_instance_archived("alpha", true).unwrap();
        let records: Vec<InstanceData> =
            serde_json::from_value(storage.state().get_instances().clone()).unwrap();
        assert!(records[0].archived);

        storage.set_instance_archived("alpha", false).unwrap();
        let records: Vec<InstanceData> =
            serde_json::from_value(storage.state().get_instances().clone()).unwrap();
        assert!(!records[0].archived);
    }

    #[tokio::test]
    async fn test_load_merges_idempotently() {
        let dir = TempDir::new().unwrap();
        let mut storage = Storage::new(State::load_from_dir(dir.path()));

        let json = serde_json::to_value(vec![paused_record("alpha")]).unwrap();
        storage.state_mut().save_instances(json).unwrap();

        let first = storage.load_instances().await.unwrap();
        storage.save_instances(&first).await.unwrap();
        let second = storage.load_instances().await.unwrap();

        assert_eq!(first.len(), second.len());
        assert_eq!(
            first[0].lock().await.title,
            second[0].lock().await.title
        );
    }
}
