// ABOUTME: Git command execution helpers and name sanitization

use std::path::{Path, PathBuf};
use std::process::Command;

use super::GitError;

/// Runs a git command in the given directory, returning stdout on success.
///
/// Failures carry the combined stdout and stderr so callers can surface an
/// actionable message.
pub(crate) fn run_git_command(dir: &Path, args: &[&str]) -> Result<String, GitError> {
    let output = Command::new("git")
        .current_dir(dir)
        .args(args)
        .output()
        .map_err(GitError::Io)?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if output.status.success() {
        return Ok(stdout);
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let mut combined = stdout;
    if !stderr.is_empty() {
        if !combined.is_empty() {
            combined.push('\n');
        }
        combined.push_str(stderr.trim_end());
    }
    Err(GitError::CommandFailed {
        command: args.join(" "),
        output: combined.trim().to_string(),
    })
}

/// Finds the root of the repository containing `path`.
pub(crate) fn find_git_repo_root(path: &Path) -> Result<PathBuf, GitError> {
    let dir = if path.is_dir() {
        path
    } else {
        path.parent().unwrap_or(path)
    };

    match run_git_command(dir, &["rev-parse", "--show-toplevel"]) {
        Ok(output) => Ok(PathBuf::from(output.trim())),
        Err(GitError::CommandFailed { output, .. }) if output.contains("not a git repository") => {
            Err(GitError::NotARepository(path.display().to_string()))
        }
        Err(e) => Err(e),
    }
}

/// Strips characters that are invalid in branch names on any supported
/// platform. Idempotent: sanitizing an already-sanitized name is a no-op.
pub fn sanitize_branch_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '\\' | '~' | '^' | ':' | '?' | '*' | '[' | ']' => '-',
            c if c.is_whitespace() => '-',
            c => c,
        })
        .collect();

    cleaned
        .trim_start_matches(['-', '/'])
        .trim_end_matches('/')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_branch_name() {
        assert_eq!(sanitize_branch_name("user/mytask"), "user/mytask");
        assert_eq!(sanitize_branch_name("DOMAIN\\user/task"), "DOMAIN-user/task");
        assert_eq!(sanitize_branch_name("has space"), "has-space");
        assert_eq!(sanitize_branch_name("odd~name^1"), "odd-name-1");
        assert_eq!(sanitize_branch_name("trailing/"), "trailing");
        assert_eq!(sanitize_branch_name("-leading"), "leading");
    }

    #[test]
    fn test_sanitize_branch_name_is_idempotent() {
        for input in ["user/mytask", "DOMAIN\\user", "a b:c*d", "x?y[z]"] {
            let once = sanitize_branch_name(input);
            assert_eq!(sanitize_branch_name(&once), once);
        }
    }

    #[test]
    fn test_run_git_command_failure_carries_output() {
        let dir = std::env::temp_dir();
        let err = run_git_command(&dir, &["no-such-subcommand"]).unwrap_err();
        match err {
            GitError::CommandFailed { command, output } => {
                assert_eq!(command, "no-such-subcommand");
                assert!(!output.is_empty());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
