//! Reconciliation of merge request and codebase resources.
//!
//! A reconciler re-reads the live resource on every call and either finishes
//! ([`Outcome::Done`]), asks to be called again later
//! ([`Outcome::RetryAfter`]) or fails with a [`ReconcileError`]. Only the
//! [`ControllerRunner`] turns those results into scheduling decisions.

mod codebase;
mod merge_request;
mod runner;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::cached_files::{CachedFileError, CachedFileStore};
use crate::config::Settings;
use crate::git::{GitCredentials, GitError, GitWorkspace};
use crate::services::{CiService, ResourceStore, ReviewService, ServiceError};
use crate::values::ValuesError;

pub use codebase::CodebaseController;
pub use merge_request::{MergeRequestController, MergeRequestState};
pub use runner::{ControllerRunner, RunnerOptions, RunnerStats};

/// Result of a successful reconcile pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing left to do until the resource changes.
    Done,
    /// The resource is waiting on something external; reconcile again after the delay.
    RetryAfter(Duration),
}

/// Underlying failure of a reconcile step.
#[derive(Error, Debug)]
pub enum FailureCause {
    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Values(#[from] ValuesError),

    #[error(transparent)]
    CachedFiles(#[from] CachedFileError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ReconcileError {
    /// The resource itself is incomplete; retrying only helps once someone fixes it.
    #[error("Invalid resource configuration: {0}")]
    Configuration(String),

    #[error("{context}: {cause}")]
    Failed {
        context: String,
        #[source]
        cause: FailureCause,
    },
}

impl ReconcileError {
    pub fn configuration(message: impl Into<String>) -> Self {
        ReconcileError::Configuration(message.into())
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, ReconcileError::Configuration(_))
    }

    pub fn cause(&self) -> Option<&FailureCause> {
        match self {
            ReconcileError::Failed { cause, .. } => Some(cause),
            ReconcileError::Configuration(_) => None,
        }
    }
}

/// Attaches the attempted operation to a failure.
pub(crate) trait Context<T> {
    fn context(self, context: impl Into<String>) -> Result<T, ReconcileError>;
}

impl<T, E: Into<FailureCause>> Context<T> for Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T, ReconcileError> {
        self.map_err(|e| ReconcileError::Failed {
            context: context.into(),
            cause: e.into(),
        })
    }
}

/// A reconcile entry point driven by [`ControllerRunner`].
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Resource kind, used in logs.
    fn kind(&self) -> &'static str;

    async fn reconcile(&self, name: &str) -> Result<Outcome, ReconcileError>;
}

/// Handles shared by both controllers.
#[derive(Clone)]
pub struct ControllerContext {
    pub settings: Arc<Settings>,
    pub store: Arc<dyn ResourceStore>,
    pub review: Arc<dyn ReviewService>,
    pub ci: Arc<dyn CiService>,
    pub cached_files: CachedFileStore,
}

impl ControllerContext {
    pub fn new(
        settings: Settings,
        store: Arc<dyn ResourceStore>,
        review: Arc<dyn ReviewService>,
        ci: Arc<dyn CiService>,
    ) -> Self {
        let cached_files = CachedFileStore::new(settings.cached_files_ttl());
        Self {
            settings: Arc::new(settings),
            store,
            review,
            ci,
            cached_files,
        }
    }

    /// Replaces the cached-file store with one shared with an edit flow.
    pub fn with_cached_files(mut self, cached_files: CachedFileStore) -> Self {
        self.cached_files = cached_files;
        self
    }

    async fn git_credentials(&self) -> Result<GitCredentials, ReconcileError> {
        let key = self
            .store
            .secret_value(
                &self.settings.git_key_secret_name,
                &self.settings.git_key_secret_key,
            )
            .await
            .context("unable to read git private key")?;
        Ok(GitCredentials::new(self.settings.git_username.clone(), key))
    }

    /// Opens an empty workspace for `project` under `<temp_folder>/<purpose>`.
    async fn open_workspace(
        &self,
        purpose: &str,
        project: &str,
    ) -> Result<GitWorkspace, ReconcileError> {
        let credentials = self.git_credentials().await?;
        let base = self.settings.temp_folder.join(purpose);
        GitWorkspace::create(&base, project, &credentials).context("unable to create workspace")
    }
}
