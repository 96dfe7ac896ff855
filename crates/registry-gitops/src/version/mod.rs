//! Version handling for registry branches and tags.
//!
//! Branch names double as registry versions (`1.9.2`, `1.5.6-SNAPSHOT.400`),
//! with `master` acting as the baseline every other version sorts after.

mod branch;
mod filter;

use thiserror::Error;

pub use branch::{branch_version, lowest_version, sort_by_version, update_branches, Version};
pub use filter::{Comparison, VersionFilter, Versioned};

/// Errors raised while parsing versions or filter expressions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("Invalid version '{input}': {reason}")]
    InvalidVersion { input: String, reason: String },

    #[error("Invalid version filter '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}
