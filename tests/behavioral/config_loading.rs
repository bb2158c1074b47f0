// ABOUTME: Behavioral tests for configuration and state file handling

use anyhow::Result;
use tempfile::TempDir;

use claude_squad::config::{Config, SessionType, State, SummaryMode, CONFIG_FILE_NAME};

#[test]
fn test_first_load_materializes_defaults() -> Result<()> {
    let dir = TempDir::new()?;

    let config = Config::load_from_dir(dir.path());

    assert!(dir.path().join(CONFIG_FILE_NAME).exists());
    assert_eq!(config.default_session_type, SessionType::Zellij);
    assert_eq!(config.summary_mode, SummaryMode::Regex);
    assert_eq!(config.daemon_poll_interval, 1000);

    // The written file parses back to the same values.
    let reloaded = Config::load_from_dir(dir.path());
    assert_eq!(reloaded.branch_prefix, config.branch_prefix);
    Ok(())
}

#[test]
fn test_corrupt_config_backed_up_and_defaulted() -> Result<()> {
    let dir = TempDir::new()?;
    std::fs::write(dir.path().join(CONFIG_FILE_NAME), "][ definitely not json")?;

    let config = Config::load_from_dir(dir.path());
    assert_eq!(config.daemon_poll_interval, 1000);

    let backup_count = std::fs::read_dir(dir.path())?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .contains("config.json.corrupt.")
        })
        .count();
    assert_eq!(backup_count, 1);
    Ok(())
}

#[test]
fn test_state_defaults_and_help_screen_bitmask() -> Result<()> {
    let dir = TempDir::new()?;

    let mut state = State::load_from_dir(dir.path());
    assert_eq!(state.get_help_screens_seen(), 0);

    state.set_help_screens_seen(0b1011)?;
    let reloaded = State::load_from_dir(dir.path());
    assert_eq!(reloaded.get_help_screens_seen(), 0b1011);
    Ok(())
}

#[test]
fn test_state_lock_file_sits_next_to_state() -> Result<()> {
    let dir = TempDir::new()?;

    let mut state = State::load_from_dir(dir.path());
    state.save()?;

    assert!(dir.path().join("state.json").exists());
    assert!(dir.path().join("state.lock").exists());
    Ok(())
}
