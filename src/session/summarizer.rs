// ABOUTME: Short activity summaries for instances, refreshed round-robin
//
// Two interchangeable strategies: pure regex extraction over the captured
// pane content, or delegation to the agent's non-interactive completion mode.
// The regex path costs nothing and never blocks; the agent path is richer but
// spends tokens and wall clock.

use anyhow::{Context, Result};
use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

use super::Instance;
use crate::config::SummaryMode;
use crate::zellij::strip_ansi_codes;

/// Minimum time between summary updates for a single instance.
pub const SUMMARY_PER_INSTANCE_COOLDOWN: Duration = Duration::from_secs(60);
/// Maximum summary length.
pub const SUMMARY_MAX_LEN: usize = 80;
/// Hard timeout for agent-generated summaries.
const SUMMARY_TIMEOUT: Duration = Duration::from_secs(30);

/// How much trailing pane content feeds the agent prompt.
const MAX_CONTENT_LEN: usize = 4000;

lazy_static! {
    static ref FILE_PATH_RE: Regex = Regex::new(
        r"([\w~./-]+\.(?:rs|go|py|js|jsx|ts|tsx|java|c|cc|cpp|h|hpp|rb|sh|md|toml|yaml|yml|json))\b"
    )
    .unwrap();
    static ref TOOL_VERB_RE: Regex = Regex::new(
        r"\b(Reading|Writing|Editing|Creating|Updating|Searching|Running|Testing|Building|Installing|Compiling|Analyzing)\b"
    )
    .unwrap();
    static ref TEST_BUILD_RE: Regex = Regex::new(
        r"\b((?:cargo|npm|pnpm|yarn|go|make|pytest)\s+(?:test|build|run|check|install|lint))\b"
    )
    .unwrap();
    static ref GIT_RE: Regex = Regex::new(
        r"\b(git\s+(?:commit|push|pull|checkout|merge|rebase|add|status|diff|clone))\b"
    )
    .unwrap();
    static ref ERROR_RE: Regex = Regex::new(r"\b(?:error|Error|ERROR|FAILED|panicked)\b").unwrap();
    static ref THINKING_RE: Regex =
        Regex::new(r"(?:Thinking|thinking|esc to interrupt|\bWaiting\b)").unwrap();
}

/// Generates summaries for instances on a staggered rotation.
pub struct Summarizer {
    mode: SummaryMode,
    /// Index of the last updated instance, for round-robin fairness.
    last_update_index: usize,
}

impl Summarizer {
    pub fn new(mode: SummaryMode) -> Self {
        Self {
            mode,
            last_update_index: 0,
        }
    }

    /// Updates the summary for the next eligible instance in the rotation.
    ///
    /// At most one instance is touched per call, and each instance at most
    /// once per cooldown period. Returns the index of the updated instance.
    pub async fn update_next_summary(
        &mut self,
        instances: &[Arc<Mutex<Instance>>],
    ) -> Option<usize> {
        if instances.is_empty() {
            return None;
        }

        let now = Utc::now();
        let start_idx = self.last_update_index;

        for offset in 0..instances.len() {
            let idx = (start_idx + offset) % instances.len();
            let mut instance = instances[idx].lock().await;

            if !instance.started() || instance.paused() {
                continue;
            }
            if let Some(updated_at) = instance.summary_updated_at {
                let elapsed = (now - updated_at).to_std().unwrap_or_default();
                if elapsed < SUMMARY_PER_INSTANCE_COOLDOWN {
                    continue;
                }
            }

            self.last_update_index = (idx + 1) % instances.len();

            if let Err(e) = self.generate_summary(&mut instance).await {
                warn!("failed to generate summary for {}: {e:#}", instance.title);
                return None;
            }
            return Some(idx);
        }

        None
    }

    async fn generate_summary(&self, instance: &mut Instance) -> Result<()> {
        let content = instance.preview().await.context("failed to get preview")?;

        if content.trim().is_empty() {
            instance.summary = "No output yet".to_string();
            instance.summary_updated_at = Some(Utc::now());
            return Ok(());
        }

        let summary = match self.mode {
            SummaryMode::Regex => extract_summary(&content),
            SummaryMode::Claude => generate_summary_via_claude(&content).await?,
        };

        instance.summary = truncate_summary(&summary);
        instance.summary_updated_at = Some(Utc::now());
        Ok(())
    }
}

/// Pure extraction of an activity description from pane content.
///
/// Scans the trailing lines for file paths, tool verbs, build/test/git
/// commands, and thinking/error markers, joining what it finds with " - ".
pub fn extract_summary(content: &str) -> String {
    let clean = strip_ansi_codes(content);

    let tail: Vec<&str> = clean
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .take(15)
        .collect();

    let mut verb: Option<String> = None;
    let mut file: Option<String> = None;
    let mut command: Option<String> = None;
    let mut thinking = false;
    let mut errored = false;

    // Oldest first, so earlier activity leads the summary.
    for line in tail.iter().rev() {
        if verb.is_none() {
            if let Some(captures) = TOOL_VERB_RE.captures(line) {
                verb = Some(captures[1].to_lowercase());
            }
        }
        if file.is_none() {
            if let Some(captures) = FILE_PATH_RE.captures(line) {
                file = Some(captures[1].to_string());
            }
        }
        if command.is_none() {
            if let Some(captures) = TEST_BUILD_RE.captures(line) {
                command = Some(captures[1].to_string());
            } else if let Some(captures) = GIT_RE.captures(line) {
                command = Some(captures[1].to_string());
            }
        }
        thinking = thinking || THINKING_RE.is_match(line);
        errored = errored || ERROR_RE.is_match(line);
    }

    let mut parts: Vec<String> = Vec::new();
    match (verb, file) {
        (Some(verb), Some(file)) => parts.push(format!("{verb} {file}")),
        (Some(verb), None) => parts.push(verb),
        (None, Some(file)) => parts.push(file),
        (None, None) => {}
    }
    if let Some(command) = command {
        parts.push(command);
    }
    if errored {
        parts.push("error".to_string());
    }
    if thinking {
        parts.push("thinking".to_string());
    }

    truncate_summary(&parts.join(" - "))
}

/// Delegates summarization to the agent's non-interactive mode.
async fn generate_summary_via_claude(content: &str) -> Result<String> {
    // The tail of the pane is the relevant part.
    let tail_start = content
        .len()
        .saturating_sub(MAX_CONTENT_LEN);
    let tail = &content[floor_char_boundary(content, tail_start)..];

    let prompt = format!(
        "Summarize what's happening in this coding agent terminal session in 10 words or less. \
         Focus on the current action or state. Be concise. Only output the summary, nothing else.\n\n\
         Terminal output:\n{tail}"
    );

    let output = tokio::time::timeout(
        SUMMARY_TIMEOUT,
        tokio::process::Command::new("claude")
            .args(["--print", &prompt])
            .stdin(Stdio::null())
            .output(),
    )
    .await
    .map_err(|_| anyhow::anyhow!("summary generation timed out"))?
    .context("claude command failed")?;

    if !output.status.success() {
        anyhow::bail!(
            "claude command failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let summary = String::from_utf8_lossy(&output.stdout)
        .trim()
        .trim_matches(['"', '\''])
        .to_string();
    Ok(summary)
}

/// Truncates to the summary length limit on a character boundary.
fn truncate_summary(summary: &str) -> String {
    if summary.chars().count() <= SUMMARY_MAX_LEN {
        return summary.to_string();
    }
    let truncated: String = summary.chars().take(SUMMARY_MAX_LEN - 3).collect();
    format!("{truncated}...")
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}
