// ABOUTME: Persistent application state shared between the TUI and the daemon
//
// The state file holds a help-screens bitmask and the serialized instance
// list as an opaque JSON blob. Reads take a shared advisory lock, writes an
// exclusive one, and a modification-time watermark lets either process cheaply
// detect that the other has written.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::warn;

use super::{get_config_dir, FileLock};

pub const STATE_FILE_NAME: &str = "state.json";

/// Application state that persists between sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    /// Bitmask tracking which help screens have been shown.
    #[serde(default)]
    pub help_screens_seen: u32,

    /// Serialized instance records, kept opaque at this layer.
    #[serde(default = "empty_instances", rename = "instances")]
    instances_data: serde_json::Value,

    /// When the state file was last read from disk (not serialized).
    #[serde(skip)]
    last_mod_time: Option<SystemTime>,

    /// Directory the state is persisted in (not serialized).
    #[serde(skip)]
    config_dir: PathBuf,
}

fn empty_instances() -> serde_json::Value {
    serde_json::Value::Array(Vec::new())
}

impl Default for State {
    fn default() -> Self {
        Self {
            help_screens_seen: 0,
            instances_data: empty_instances(),
            last_mod_time: None,
            config_dir: get_config_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }
}

impl State {
    /// Load the state from the default config directory.
    ///
    /// If the file cannot be read, the default state is returned; a missing
    /// file additionally writes the defaults back.
    pub fn load() -> Self {
        match get_config_dir() {
            Ok(dir) => Self::load_from_dir(&dir),
            Err(e) => {
                warn!("failed to get config directory: {e}");
                Self::default()
            }
        }
    }

    /// Load the state from an explicit directory under a shared lock.
    pub fn load_from_dir(config_dir: &Path) -> Self {
        let state_path = config_dir.join(STATE_FILE_NAME);

        let mut lock = FileLock::new(&state_path);
        let locked = match lock.rlock() {
            Ok(()) => true,
            Err(e) => {
                // Stale data is preferable to a hard failure here.
                warn!("failed to acquire read lock: {e}");
                false
            }
        };

        let mod_time = fs::metadata(&state_path).and_then(|m| m.modified()).ok();

        let data = match fs::read(&state_path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if locked {
                    // Release before save takes the exclusive lock.
                    let _ = lock.unlock();
                }
                let mut default = Self::default();
                default.config_dir = config_dir.to_path_buf();
                if let Err(e) = default.save() {
                    warn!("failed to save default state: {e}");
                }
                return default;
            }
            Err(e) => {
                warn!("failed to read state file: {e}");
                let mut default = Self::default();
                default.config_dir = config_dir.to_path_buf();
                return default;
            }
        };

        let mut state: State = match serde_json::from_slice(&data) {
            Ok(state) => state,
            Err(e) => {
                warn!("failed to parse state file: {e}");
                Self::default()
            }
        };
        state.config_dir = config_dir.to_path_buf();
        state.last_mod_time = mod_time;
        state
    }

    /// Save the state to disk under an exclusive lock.
    pub fn save(&mut self) -> Result<()> {
        fs::create_dir_all(&self.config_dir).with_context(|| {
            format!(
                "failed to create config directory {}",
                self.config_dir.display()
            )
        })?;

        let state_path = self.config_dir.join(STATE_FILE_NAME);

        let mut lock = FileLock::new(&state_path);
        lock.lock().context("failed to acquire write lock")?;

        let data = serde_json::to_vec_pretty(&*self).context("failed to marshal state")?;
        fs::write(&state_path, data)
            .with_context(|| format!("failed to write state to {}", state_path.display()))?;

        // Advance the watermark so our own write does not trigger a refresh.
        self.last_mod_time = fs::metadata(&state_path).and_then(|m| m.modified()).ok();

        Ok(())
    }

    /// The directory this state persists in.
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    // -- Instance storage --

    /// Store the raw instance blob and persist.
    pub fn save_instances(&mut self, instances_json: serde_json::Value) -> Result<()> {
        self.instances_data = instances_json;
        self.save()
    }

    /// The raw instance blob.
    pub fn get_instances(&self) -> &serde_json::Value {
        &self.instances_data
    }

    /// Remove all stored instances and persist.
    pub fn delete_all_instances(&mut self) -> Result<()> {
        self.instances_data = empty_instances();
        self.save()
    }

    // -- App state --

    pub fn get_help_screens_seen(&self) -> u32 {
        self.help_screens_seen
    }

    pub fn set_help_screens_seen(&mut self, seen: u32) -> Result<()> {
        self.help_screens_seen = seen;
        self.save()
    }

    // -- Disk sync --

    /// The on-disk modification time of the state file.
    fn state_mod_time(&self) -> Result<SystemTime> {
        let state_path = self.config_dir.join(STATE_FILE_NAME);
        fs::metadata(&state_path)
            .and_then(|m| m.modified())
            .context("failed to stat state file")
    }

    /// True if the state file has been modified since we last read it.
    pub fn needs_refresh(&self) -> bool {
        let Ok(mod_time) = self.state_mod_time() else {
            return false;
        };
        match self.last_mod_time {
            Some(last) => mod_time > last,
            None => true,
        }
    }

    /// Reload the state from disk if another process has written it.
    /// Returns whether a refresh occurred.
    pub fn refresh_from_disk(&mut self) -> Result<bool> {
        if !self.needs_refresh() {
            return Ok(false);
        }

        let state_path = self.config_dir.join(STATE_FILE_NAME);

        let mut lock = FileLock::new(&state_path);
        lock.rlock().context("failed to acquire read lock")?;

        let mod_time = self.state_mod_time()?;
        let data = fs::read(&state_path).context("failed to read state file")?;
        let new_state: State =
            serde_json::from_slice(&data).context("failed to parse state file")?;

        self.help_screens_seen = new_state.help_screens_seen;
        self.instances_data = new_state.instances_data;
        self.last_mod_time = Some(mod_time);

        Ok(true)
    }

    /// Force the watermark back so the next refresh check re-reads the file.
    #[cfg(test)]
    pub fn rewind_watermark(&mut self) {
        self.last_mod_time = Some(SystemTime::UNIX_EPOCH);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_missing_state_yields_defaults_and_writes_back() {
        let dir = TempDir::new().unwrap();
        let state = State::load_from_dir(dir.path());

        assert_eq!(state.get_help_screens_seen(), 0);
        assert_eq!(state.get_instances(), &json!([]));
        assert!(dir.path().join(STATE_FILE_NAME).exists());
    }

    #[test]
    fn test_state_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut state = State::load_from_dir(dir.path());
        state.help_screens_seen = 0b101;
        state
            .save_instances(json!([{"title": "alpha"}]))
            .unwrap();

        let loaded = State::load_from_dir(dir.path());
        assert_eq!(loaded.get_help_screens_seen(), 0b101);
        assert_eq!(loaded.get_instances(), &json!([{"title": "alpha"}]));
    }

    #[test]
    fn test_delete_all_instances() {
        let dir = TempDir::new().unwrap();
        let mut state = State::load_from_dir(dir.path());
        state.save_instances(json!([{"title": "alpha"}])).unwrap();
        state.delete_all_instances().unwrap();

        let loaded = State::load_from_dir(dir.path());
        assert_eq!(loaded.get_instances(), &json!([]));
    }

    #[test]
    fn test_refresh_noop_when_unchanged() {
        let dir = TempDir::new().unwrap();
        let mut state = State::load_from_dir(dir.path());
        state.save().unwrap();

        assert!(!state.refresh_from_disk().unwrap());
    }

    #[test]
    fn test_refresh_picks_up_external_write() {
        let dir = TempDir::new().unwrap();
        let mut ours = State::load_from_dir(dir.path());

        // Another process writes new instance data.
        let mut theirs = State::load_from_dir(dir.path());
        theirs.save_instances(json!([{"title": "beta"}])).unwrap();

        // Force the watermark to be older than the write above so the test
        // does not depend on filesystem mtime granularity.
        ours.rewind_watermark();
        assert!(ours.refresh_from_disk().unwrap());
        assert_eq!(ours.get_instances(), &json!([{"title": "beta"}]));
    }

    #[test]
    fn test_own_save_does_not_trigger_refresh() {
        let dir = TempDir::new().unwrap();
        let mut state = State::load_from_dir(dir.path());
        state.save_instances(json!([{"title": "gamma"}])).unwrap();

        assert!(!state.needs_refresh());
    }
}
