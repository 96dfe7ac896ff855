pub mod cached_files;
pub mod config;
pub mod controller;
pub mod git;
pub mod resource;
pub mod services;
pub mod telemetry;
pub mod values;
pub mod version;

pub use cached_files::{apply_cached_files, CachedFile, CachedFileError, CachedFileStore};
pub use config::{load_settings, ConfigError, Settings};
pub use controller::{
    CodebaseController, ControllerContext, ControllerRunner, MergeRequestController, Outcome,
    ReconcileError, Reconciler, RunnerOptions, RunnerStats,
};
pub use git::{GitCredentials, GitError, GitUser, GitWorkspace};
pub use resource::{Codebase, CodebaseBranch, MergeRequest, MergeStatus, ObjectMeta};
pub use services::{CiService, ResourceStore, ReviewService, ServiceError};
pub use values::{merge_values, ValuesError, VALUES_LOCATION};
pub use version::{branch_version, Version, VersionError, VersionFilter, Versioned};
