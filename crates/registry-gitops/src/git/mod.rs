//! Git operations for registry repositories.

pub mod auth;
pub mod error;
pub mod parse;
pub mod types;
pub mod workspace;

pub use auth::GitCredentials;
pub use error::GitError;
pub use types::*;
pub use workspace::GitWorkspace;
