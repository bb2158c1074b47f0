// ABOUTME: Extraction of the agent's own session ID from its on-disk project files
//
// Claude stores conversation state under ~/.claude/projects/<encoded-path>/.
// Capturing the session ID lets an instance resume its conversation with
// `--resume` after the host restarts.

use serde::Deserialize;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClaudeSessionError {
    /// The project directory has not been created yet. Expected for new
    /// instances; must not be logged as a warning.
    #[error("claude project directory not found")]
    ProjectNotFound,
    /// The project directory exists but holds no session files yet.
    /// Expected shortly after startup; must not be logged as a warning.
    #[error("no session files found")]
    NoSessionFiles,
    #[error("no session ID found in file: {0}")]
    NoSessionId(String),
    #[error("failed to get home directory")]
    NoHomeDir,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Deserialize)]
struct SessionMessage {
    #[serde(rename = "sessionId", default)]
    session_id: String,
}

/// Extracts the most recent Claude session ID for the given worktree.
pub fn extract_claude_session_id(worktree_path: &str) -> Result<String, ClaudeSessionError> {
    let home = dirs::home_dir().ok_or(ClaudeSessionError::NoHomeDir)?;
    let projects_root = home.join(".claude").join("projects");
    extract_claude_session_id_from_root(&projects_root, worktree_path)
}

/// As `extract_claude_session_id`, with the projects root made explicit.
pub fn extract_claude_session_id_from_root(
    projects_root: &Path,
    worktree_path: &str,
) -> Result<String, ClaudeSessionError> {
    let project_dir = projects_root.join(path_to_claude_project_dir(worktree_path));
    if !project_dir.exists() {
        return Err(ClaudeSessionError::ProjectNotFound);
    }

    // Newest .jsonl file, excluding subagent transcripts.
    let mut session_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    for entry in fs::read_dir(&project_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.ends_with(".jsonl") || name.starts_with("agent-") {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
        session_files.push((entry.path(), modified));
    }

    if session_files.is_empty() {
        return Err(ClaudeSessionError::NoSessionFiles);
    }

    session_files.sort_by(|a, b| b.1.cmp(&a.1));
    extract_session_id_from_jsonl(&session_files[0].0)
}

/// Converts a filesystem path to Claude's project directory name: every `/`
/// becomes `-`, with the leading dash of absolute paths preserved.
pub(crate) fn path_to_claude_project_dir(path: &str) -> String {
    let result = path.replace('/', "-");
    if path.starts_with('/') && !result.starts_with('-') {
        return format!("-{result}");
    }
    result
}

/// Reads a session .jsonl file line by line until a sessionId appears.
fn extract_session_id_from_jsonl(file_path: &Path) -> Result<String, ClaudeSessionError> {
    let file = fs::File::open(file_path)?;
    let reader = BufReader::new(file);

    for line in reader.lines() {
        let line = line?;
        // Lines that are not valid JSON are skipped.
        let Ok(message) = serde_json::from_str::<SessionMessage>(&line) else {
            continue;
        };
        if !message.session_id.is_empty() {
            return Ok(message.session_id);
        }
    }

    Err(ClaudeSessionError::NoSessionId(
        file_path.display().to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_path_to_claude_project_dir() {
        assert_eq!(
            path_to_claude_project_dir("/Users/u/.claude-squad/worktrees/u/colors_18840af3cf6904f0"),
            "-Users-u-.claude-squad-worktrees-u-colors_18840af3cf6904f0"
        );
        assert_eq!(path_to_claude_project_dir("relative/path"), "relative-path");
    }

    #[test]
    fn test_missing_project_dir_is_expected_absence() {
        let root = TempDir::new().unwrap();
        let err = extract_claude_session_id_from_root(root.path(), "/no/such/worktree")
            .unwrap_err();
        assert!(matches!(err, ClaudeSessionError::ProjectNotFound));
    }

    #[test]
    fn test_empty_project_dir_is_expected_absence() {
        let root = TempDir::new().unwrap();
        let project_dir = root.path().join(path_to_claude_project_dir("/work/tree"));
        fs::create_dir_all(&project_dir).unwrap();

        let err = extract_claude_session_id_from_root(root.path(), "/work/tree").unwrap_err();
        assert!(matches!(err, ClaudeSessionError::NoSessionFiles));
    }

    #[test]
    fn test_session_id_extracted_from_newest_file() {
        let root = TempDir::new().unwrap();
        let project_dir = root.path().join(path_to_claude_project_dir("/work/tree"));
        fs::create_dir_all(&project_dir).unwrap();

        fs::write(
            project_dir.join("old.jsonl"),
            "{\"sessionId\": \"old-session\"}\n",
        )
        .unwrap();
        // Agent transcripts are excluded even when newer.
        fs::write(
            project_dir.join("agent-123.jsonl"),
            "{\"sessionId\": \"agent-session\"}\n",
        )
        .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        fs::write(
            project_dir.join("new.jsonl"),
            "not json\n{\"other\": 1}\n{\"sessionId\": \"new-session\"}\n",
        )
        .unwrap();

        let id = extract_claude_session_id_from_root(root.path(), "/work/tree").unwrap();
        assert_eq!(id, "new-session");
    }

    #[test]
    fn test_file_without_session_id() {
        let root = TempDir::new().unwrap();
        let project_dir = root.path().join(path_to_claude_project_dir("/work/tree"));
        fs::create_dir_all(&project_dir).unwrap();
        fs::write(project_dir.join("s.jsonl"), "{\"foo\": \"bar\"}\n").unwrap();

        let err = extract_claude_session_id_from_root(root.path(), "/work/tree").unwrap_err();
        assert!(matches!(err, ClaudeSessionError::NoSessionId(_)));
    }
}
