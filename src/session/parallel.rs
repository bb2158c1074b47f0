// ABOUTME: Bounded-parallelism periodic refresh of instance activity and metadata
//
// The activity tick fans out across instances under a CPU-count semaphore.
// Diff computation and session-id capture are fire-and-forget background
// tasks, naturally rate-limited by per-instance eligibility predicates.

use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tracing::warn;

use super::{Instance, Status};

/// Result of the activity check for a single instance.
#[derive(Debug, Default, Clone)]
pub struct UpdateResult {
    /// Pane content changed since the previous tick.
    pub updated: bool,
    /// A confirmation prompt is currently displayed.
    pub has_prompt: bool,
    /// An enter keystroke was issued this tick (auto-yes path).
    pub tapped_enter: bool,
    /// The agent program was found dead and restarted.
    pub was_restarted: bool,
    /// Error encountered while checking, if any.
    pub error: Option<String>,
}

fn worker_limit() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Runs one activity tick over all instances in parallel, bounded by the
/// processor count.
///
/// For every started, non-paused instance exactly one of three things
/// happens: its status becomes Running (content changed), an enter tap is
/// issued (prompt waiting), or its status becomes Ready (quiet, no prompt).
/// Results are keyed by input index.
pub async fn parallel_update(instances: &[Arc<Mutex<Instance>>]) -> Vec<UpdateResult> {
    let mut results: Vec<UpdateResult> = vec![UpdateResult::default(); instances.len()];
    let semaphore = Arc::new(Semaphore::new(worker_limit()));

    let mut handles = Vec::new();
    for (idx, instance) in instances.iter().enumerate() {
        let should_skip = {
            let instance = instance.lock().await;
            !instance.started() || instance.paused()
        };
        if should_skip {
            continue;
        }

        let instance = Arc::clone(instance);
        let semaphore = Arc::clone(&semaphore);
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire().await;
            let mut instance = instance.lock().await;
            let mut result = UpdateResult::default();

            // A reboot can leave the session alive with the program dead.
            match instance.check_and_restart_program().await {
                Ok(restarted) => result.was_restarted = restarted,
                Err(e) => {
                    warn!("restart check failed for {}: {e:#}", instance.title);
                    result.error = Some(format!("{e:#}"));
                }
            }

            let (updated, has_prompt) = instance.has_updated().await;
            result.updated = updated;
            result.has_prompt = has_prompt;

            if updated {
                instance.set_status(Status::Running);
            } else if has_prompt {
                // The tap itself is gated on the instance's auto-yes flag.
                instance.tap_enter().await;
                result.tapped_enter = true;
            } else {
                instance.set_status(Status::Ready);
            }

            (idx, result)
        }));
    }

    for handle in handles {
        match handle.await {
            Ok((idx, result)) => results[idx] = result,
            Err(e) => warn!("activity worker panicked: {e}"),
        }
    }

    results
}

/// Spawns background diff updates for every instance that is due for one.
/// Non-blocking; returns as soon as the tasks are spawned.
pub async fn background_update_diff_stats(instances: &[Arc<Mutex<Instance>>]) {
    for instance in instances {
        let due = {
            let instance = instance.lock().await;
            instance.should_update_diff()
        };
        if !due {
            continue;
        }

        let instance = Arc::clone(instance);
        tokio::spawn(async move {
            let mut instance = instance.lock().await;
            if let Err(e) = instance.update_diff_stats() {
                warn!("diff update failed for {}: {e:#}", instance.title);
            }
        });
    }
}

/// Spawns background session-id capture for running instances that have no
/// captured ID yet. Each capture is a short file scan.
pub async fn background_capture_claude_session_ids(instances: &[Arc<Mutex<Instance>>]) {
    for instance in instances {
        let needs_capture = {
            let instance = instance.lock().await;
            instance.started() && !instance.paused() && instance.claude_session_id.is_empty()
        };
        if !needs_capture {
            continue;
        }

        let instance = Arc::clone(instance);
        tokio::spawn(async move {
            let mut instance = instance.lock().await;
            instance.capture_claude_session_id();
        });
    }
}
