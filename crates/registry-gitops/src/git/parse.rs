//! Git output parsing helpers.

use std::process::Output;

use super::error::GitError;

/// Formats a git error with both stdout and stderr for better debugging.
pub fn format_git_error(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();

    match (stderr.is_empty(), stdout.is_empty()) {
        (true, true) => format!(
            "Command failed with exit code {}",
            output.status.code().unwrap_or(-1)
        ),
        (true, false) => stdout,
        (false, true) => stderr,
        (false, false) => format!("{}\n{}", stderr, stdout),
    }
}

/// Classifies git output of a failed `operation` into a specific error variant.
pub fn classify_git_error(operation: &str, message: &str) -> GitError {
    let lower = message.to_lowercase();
    let operation = operation.to_string();
    let message = message.trim().to_string();

    if lower.contains("couldn't find remote ref")
        || lower.contains("reference not found")
        || lower.contains("unknown revision")
        || lower.contains("did not match any file(s) known to git")
        || lower.contains("invalid refspec")
    {
        return GitError::ReferenceNotFound { operation, message };
    }

    if lower.contains("non-fast-forward")
        || lower.contains("not possible to fast-forward")
        || lower.contains("refusing to merge unrelated histories")
        || lower.contains("[rejected]")
    {
        return GitError::NonFastForward { operation, message };
    }

    if lower.contains("could not resolve host")
        || lower.contains("connection refused")
        || lower.contains("connection timed out")
        || lower.contains("network is unreachable")
        || lower.contains("unable to access")
        || lower.contains("failed to connect")
        || lower.contains("couldn't connect to server")
        || lower.contains("the remote end hung up unexpectedly")
    {
        return GitError::Network { operation, message };
    }

    if lower.contains("authentication failed")
        || lower.contains("permission denied")
        || lower.contains("invalid credentials")
    {
        return GitError::AuthFailed { operation, message };
    }

    GitError::Command { operation, message }
}

/// Whether commit output reports that there was nothing to record.
pub fn is_nothing_to_commit(output: &str) -> bool {
    let lower = output.to_lowercase();
    lower.contains("nothing to commit")
        || lower.contains("nothing added to commit")
        || lower.contains("no changes added to commit")
}

/// Parses `git for-each-ref --format=%(refname)` output into reference names.
pub fn parse_ref_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
