// ABOUTME: Headless auto-approval daemon polling sessions while the TUI is closed
//
// The daemon shares the state file with the foreground process through the
// advisory lock and the mtime watermark: it refreshes its instance list when
// the foreground writes, and its own saves are picked up the same way.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::{get_config_dir, Config, State};
use crate::session::parallel;
use crate::session::{Instance, Storage};

const PID_FILE_NAME: &str = "daemon.pid";

fn pid_file_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join(PID_FILE_NAME))
}

/// Runs the auto-approval loop until interrupted.
///
/// Every instance is polled at the configured interval; prompts are answered
/// with an enter keystroke. Auto-yes is forced on for the daemon's lifetime,
/// which is the point of running it.
pub async fn run_daemon(config: &Config) -> Result<()> {
    let pid_path = pid_file_path()?;
    fs::write(&pid_path, std::process::id().to_string()).context("failed to write pid file")?;

    let result = daemon_loop(config).await;

    let _ = fs::remove_file(&pid_path);
    result
}

async fn daemon_loop(config: &Config) -> Result<()> {
    let state = State::load();
    let mut storage = Storage::new(state);

    let mut instances = storage
        .load_instances()
        .await
        .context("failed to load instances")?;
    force_auto_yes(&instances).await;

    info!(
        "daemon started with {} instance(s), polling every {}ms",
        instances.len(),
        config.daemon_poll_interval
    );

    let poll_interval = Duration::from_millis(config.daemon_poll_interval.max(100));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("daemon interrupted, exiting");
                return Ok(());
            }
            _ = tokio::time::sleep(poll_interval) => {}
        }

        // Pick up changes the foreground process wrote.
        match storage.sync_from_disk().await {
            Ok((synced, true)) => {
                force_auto_yes(&synced).await;
                instances = synced;
            }
            Ok((_, false)) => {}
            Err(e) => warn!("failed to sync state from disk: {e:#}"),
        }

        parallel::parallel_update(&instances).await;

        if let Err(e) = storage.save_instances(&instances).await {
            warn!("failed to save instances: {e:#}");
        }
    }
}

async fn force_auto_yes(instances: &[Arc<Mutex<Instance>>]) {
    for instance in instances {
        instance.lock().await.auto_yes = true;
    }
}

/// Launches the daemon as a detached background process of this binary.
pub fn launch_daemon() -> Result<()> {
    let exe = std::env::current_exe().context("failed to resolve current executable")?;
    std::process::Command::new(exe)
        .arg("daemon")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .context("failed to launch daemon")?;
    Ok(())
}

/// Signals a running daemon to stop, if one is recorded in the pid file.
pub fn stop_daemon() -> Result<()> {
    let pid_path = pid_file_path()?;
    let pid = match fs::read_to_string(&pid_path) {
        Ok(pid) => pid.trim().to_string(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).context("failed to read pid file"),
    };

    #[cfg(unix)]
    {
        let status = std::process::Command::new("kill")
            .arg(&pid)
            .status()
            .context("failed to signal daemon")?;
        if !status.success() {
            warn!("kill returned non-zero for daemon pid {pid}");
        }
    }
    #[cfg(not(unix))]
    {
        warn!("stopping the daemon is not supported on this platform (pid {pid})");
    }

    let _ = fs::remove_file(&pid_path);
    Ok(())
}
