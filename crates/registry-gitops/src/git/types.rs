//! Git types shared by workspaces and controllers.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Author identity recorded on commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitUser {
    pub name: String,
    pub email: String,
}

impl GitUser {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }
}

/// Result of a commit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    NothingToCommit,
}

impl CommitOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, CommitOutcome::Committed)
    }
}

/// Derives a review change identifier from `seed`.
///
/// Equal seeds always yield the same identifier, so a repeated attempt to
/// submit the same change updates it instead of opening a duplicate.
pub fn change_id(seed: &str) -> String {
    let digest = Sha1::digest(seed.as_bytes());
    format!("I{}", hex::encode(digest))
}

/// Appends the review footer carrying `change_id` to a commit message.
pub fn with_change_id(message: &str, change_id: &str) -> String {
    format!("{}\n\nChange-Id: {}", message.trim_end(), change_id)
}

/// Push refspec that submits `HEAD` for review against `branch`.
pub fn review_refspec(branch: &str) -> String {
    format!("HEAD:refs/for/{}", branch)
}
