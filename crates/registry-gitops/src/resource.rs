//! Cluster resources watched by the controllers.
//!
//! Labels and annotations carry the signalling protocol shared with the
//! admin console, so their keys and values must stay exactly as defined here.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::git::GitUser;
use crate::version::{branch_version, Version};

/// Label naming the kind of action a merge request performs.
pub const LABEL_ACTION: &str = "console/action";
/// Action label value requesting branch promotion.
pub const ACTION_BRANCH_MERGE: &str = "branch-merge";
/// Label naming what a merge request changes.
pub const LABEL_TARGET: &str = "console/target";
/// Target values of merge requests that move a registry to another version.
pub const TARGET_REGISTRY_VERSION_UPDATE: &str = "registry-version-update";
pub const TARGET_CLUSTER_UPDATE: &str = "cluster-update";
pub const LABEL_SOURCE_BRANCH: &str = "console/source-branch";
pub const LABEL_TARGET_BRANCH: &str = "console/target-branch";
/// Label holding the approval mode of a merge request.
pub const LABEL_APPROVE: &str = "console/approve";
pub const APPROVE_AUTO: &str = "auto";

/// Annotation holding a JSON array of pending follow-up action tokens.
pub const ANNOTATION_ACTIONS: &str = "actions";
/// Pending action that provisions the registry backup schedule job.
pub const ACTION_BACKUP_SCHEDULE: &str = "backup-schedule";

pub const ANNOTATION_TEMPLATE_NAME: &str = "registry-parameters/template-name";
pub const ANNOTATION_CREATOR_USERNAME: &str = "registry-parameters/creator-username";
pub const ANNOTATION_CREATOR_EMAIL: &str = "registry-parameters/creator-email";
/// Annotation holding the JSON values override patch applied on import.
pub const ANNOTATION_VALUES: &str = "registry-parameters/values";

/// Annotation used as memory between reconciliations of a registry.
pub const ANNOTATION_STATUS: &str = "console-status";
pub const STATUS_RUNNING_JOBS: &str = "running-jobs";
pub const STATUS_INACTIVE_BRANCHES: &str = "inactive-branches";

/// Git path sentinel of a codebase that has not been imported yet.
pub const REPO_NOT_READY: &str = "NOT_READY";
pub const REGISTRY_CODEBASE_TYPE: &str = "registry";
pub const BRANCH_STATUS_ACTIVE: &str = "active";
pub const DEFAULT_TARGET_BRANCH: &str = "master";

/// Metadata for a resource, following K8s conventions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,

    /// Opaque token changed by the store on every write; used to fence updates.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_version: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Label value, treating an empty value as absent.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Annotation value, treating an empty value as absent.
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

/// Review status of a merge request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeStatus {
    #[serde(rename = "NEW")]
    New,
    #[serde(rename = "MERGED")]
    Merged,
    #[serde(rename = "ABANDONED")]
    Abandoned,
    /// Empty or unknown status values.
    #[default]
    #[serde(rename = "", other)]
    Unset,
}

/// Whether branch promotion already ran for a merge request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preparation {
    #[default]
    Pending,
    Prepared,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequestSpec {
    pub project_name: String,
    #[serde(default)]
    pub target_branch: String,
    #[serde(default)]
    pub source_branch: String,
    #[serde(default)]
    pub author_name: String,
    #[serde(default)]
    pub author_email: String,
    #[serde(default)]
    pub commit_message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequestStatus {
    #[serde(default)]
    pub value: MergeStatus,
    #[serde(default)]
    pub change_id: String,
    #[serde(default)]
    pub preparation: Preparation,
}

/// Mirror of a review-system change request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeRequest {
    pub metadata: ObjectMeta,
    pub spec: MergeRequestSpec,
    #[serde(default)]
    pub status: MergeRequestStatus,
}

impl MergeRequest {
    pub fn new(name: impl Into<String>, spec: MergeRequestSpec) -> Self {
        Self {
            metadata: ObjectMeta::new(name),
            spec,
            status: MergeRequestStatus::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Branch the change lands on, `master` when unset.
    pub fn target_branch(&self) -> &str {
        if self.spec.target_branch.is_empty() {
            DEFAULT_TARGET_BRANCH
        } else {
            &self.spec.target_branch
        }
    }

    pub fn commit_message(&self) -> String {
        if !self.spec.commit_message.is_empty() {
            return self.spec.commit_message.clone();
        }
        format!("merge {} to {}", self.spec.source_branch, self.target_branch())
    }

    pub fn author(&self) -> GitUser {
        GitUser::new(&self.spec.author_name, &self.spec.author_email)
    }

    pub fn is_branch_merge(&self) -> bool {
        self.metadata.label(LABEL_ACTION) == Some(ACTION_BRANCH_MERGE)
    }

    pub fn is_auto_approved(&self) -> bool {
        self.metadata.label(LABEL_APPROVE) == Some(APPROVE_AUTO)
    }

    /// Whether this is a merged request that moved its registry to the source branch version.
    pub fn is_merged_version_update(&self) -> bool {
        let target = self.metadata.label(LABEL_TARGET);
        self.status.value == MergeStatus::Merged
            && matches!(
                target,
                Some(TARGET_REGISTRY_VERSION_UPDATE) | Some(TARGET_CLUSTER_UPDATE)
            )
    }

    /// Decodes the pending-actions annotation. A missing annotation means no actions.
    pub fn pending_actions(&self) -> Result<Vec<String>, serde_json::Error> {
        match self.metadata.annotation(ANNOTATION_ACTIONS) {
            Some(raw) => serde_json::from_str(raw),
            None => Ok(Vec::new()),
        }
    }

    pub fn set_pending_actions(&mut self, actions: &[String]) -> Result<(), serde_json::Error> {
        let encoded = serde_json::to_string(actions)?;
        self.metadata
            .annotations
            .insert(ANNOTATION_ACTIONS.to_string(), encoded);
        Ok(())
    }
}

/// Removes every occurrence of `token`, keeping the remaining actions in order.
pub fn remove_action(actions: &[String], token: &str) -> Vec<String> {
    actions.iter().filter(|a| *a != token).cloned().collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodebaseSpec {
    #[serde(rename = "type")]
    pub codebase_type: String,
    #[serde(default)]
    pub default_branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_to_copy_in_default_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_url_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_provisioning: Option<String>,
    #[serde(default)]
    pub build_tool: String,
    #[serde(default)]
    pub git_server: String,
}

/// A managed project repository (a registry when its type says so).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Codebase {
    pub metadata: ObjectMeta,
    pub spec: CodebaseSpec,
}

impl Codebase {
    pub fn new(name: impl Into<String>, spec: CodebaseSpec) -> Self {
        Self {
            metadata: ObjectMeta::new(name),
            spec,
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn is_registry(&self) -> bool {
        self.spec.codebase_type == REGISTRY_CODEBASE_TYPE
    }

    /// Whether the initial import still has to run.
    pub fn awaiting_import(&self) -> bool {
        self.spec.git_url_path.as_deref() == Some(REPO_NOT_READY)
    }

    /// Branch the registry version is read from.
    pub fn version_branch(&self) -> &str {
        match self.spec.branch_to_copy_in_default_branch.as_deref() {
            Some(branch) if !branch.is_empty() => branch,
            _ => &self.spec.default_branch,
        }
    }

    /// Identity of the user who created the registry.
    pub fn creator(&self) -> GitUser {
        GitUser::new(
            self.metadata
                .annotation(ANNOTATION_CREATOR_USERNAME)
                .unwrap_or_default(),
            self.metadata
                .annotation(ANNOTATION_CREATOR_EMAIL)
                .unwrap_or_default(),
        )
    }

    pub fn status_marker(&self) -> Option<&str> {
        self.metadata.annotation(ANNOTATION_STATUS)
    }

    pub fn set_status_marker(&mut self, marker: &str) {
        self.metadata
            .annotations
            .insert(ANNOTATION_STATUS.to_string(), marker.to_string());
    }

    /// Removes the status annotation if it currently holds `marker`.
    /// Returns whether anything changed.
    pub fn clear_status_marker(&mut self, marker: &str) -> bool {
        if self.status_marker() == Some(marker) {
            self.metadata.annotations.remove(ANNOTATION_STATUS);
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodebaseBranchSpec {
    pub codebase_name: String,
    pub branch_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodebaseBranchStatus {
    #[serde(default)]
    pub value: String,
}

/// One branch sub-resource of a codebase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodebaseBranch {
    pub metadata: ObjectMeta,
    pub spec: CodebaseBranchSpec,
    #[serde(default)]
    pub status: CodebaseBranchStatus,
}

impl CodebaseBranch {
    pub fn is_active(&self) -> bool {
        self.status.value == BRANCH_STATUS_ACTIVE
    }

    pub fn version(&self) -> Version {
        branch_version(&self.spec.branch_name)
    }
}
