//! Interfaces of the external systems the controllers drive.
//!
//! The cluster resource store, the code-review system and the CI system are
//! reached only through these traits; the controllers never talk to a
//! transport directly.

use std::collections::BTreeMap;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::git::GitUser;
use crate::resource::{Codebase, CodebaseBranch, MergeRequest};

/// Review project status meaning the repository is ready for pushes.
pub const PROJECT_STATUS_OK: &str = "OK";
/// CI result of a successfully finished build.
pub const JOB_STATUS_SUCCESS: &str = "SUCCESS";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} '{name}' was modified concurrently")]
    Conflict { kind: &'static str, name: String },

    #[error("Service request failed: {0}")]
    Request(String),
}

impl ServiceError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ServiceError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ServiceError::Conflict { .. })
    }
}

/// Typed access to the cluster resource store.
///
/// Updates are fenced: a write whose `metadata.resource_version` no longer
/// matches the stored object fails with [`ServiceError::Conflict`], and a
/// successful write returns the object with its new version.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get_merge_request(&self, name: &str) -> Result<Option<MergeRequest>, ServiceError>;

    async fn update_merge_request(
        &self,
        merge_request: &MergeRequest,
    ) -> Result<MergeRequest, ServiceError>;

    /// Merge requests whose `spec.project_name` is `project`.
    async fn merge_requests_by_project(
        &self,
        project: &str,
    ) -> Result<Vec<MergeRequest>, ServiceError>;

    async fn get_codebase(&self, name: &str) -> Result<Option<Codebase>, ServiceError>;

    async fn update_codebase(&self, codebase: &Codebase) -> Result<Codebase, ServiceError>;

    async fn list_codebase_branches(
        &self,
        codebase: &str,
    ) -> Result<Vec<CodebaseBranch>, ServiceError>;

    async fn secret_value(&self, secret: &str, key: &str) -> Result<SecretString, ServiceError>;
}

/// A project as known to the review system.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewProject {
    pub name: String,
    pub status: String,
    /// Full reference names, e.g. `refs/heads/1.2.0`.
    #[serde(default)]
    pub branches: Vec<String>,
}

impl ReviewProject {
    pub fn is_ready(&self) -> bool {
        self.status == PROJECT_STATUS_OK
    }
}

/// One patch set of a review change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub number: u32,
    pub git_ref: String,
    #[serde(default)]
    pub commit_message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeDetails {
    pub change_id: String,
    pub project: String,
    pub branch: String,
    #[serde(default)]
    pub revisions: Vec<Revision>,
}

impl ChangeDetails {
    /// The patch set with the highest number.
    pub fn current_revision(&self) -> Option<&Revision> {
        self.revisions.iter().max_by_key(|r| r.number)
    }
}

#[async_trait]
pub trait ReviewService: Send + Sync {
    /// Looks up a project, `None` when the review system does not know it.
    async fn get_project(&self, name: &str) -> Result<Option<ReviewProject>, ServiceError>;

    async fn change_details(&self, change_id: &str) -> Result<ChangeDetails, ServiceError>;

    async fn approve_and_submit(&self, change_id: &str, author: &GitUser)
        -> Result<(), ServiceError>;
}

/// Latest build of a CI job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub result: String,
    pub build: i64,
}

impl JobStatus {
    pub fn is_success(&self) -> bool {
        self.result == JOB_STATUS_SUCCESS
    }
}

#[async_trait]
pub trait CiService: Send + Sync {
    async fn job_status(&self, job_path: &str) -> Result<JobStatus, ServiceError>;

    async fn trigger_job(
        &self,
        job_path: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<(), ServiceError>;
}

/// Path of the build job of `branch` in `project`.
pub fn build_job_path(project: &str, branch: &str) -> String {
    let upper = branch.to_uppercase();
    format!("{project}/view/{upper}/job/{upper}-Build-{project}")
}

/// Path of a provisioning job.
pub fn provisioning_job_path(job_provisioning: &str) -> String {
    format!("/job-provisions/job/ci/job/{job_provisioning}")
}
