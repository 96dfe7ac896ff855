//! Merge request reconciliation: branch promotion, auto-approval, job
//! provisioning, build gating and replay of cached edits.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, Instrument};

use super::{Context, ControllerContext, Outcome, ReconcileError, Reconciler};
use crate::cached_files::apply_cached_files;
use crate::git::{change_id, review_refspec, with_change_id, GitWorkspace};
use crate::resource::{
    remove_action, Codebase, MergeRequest, MergeStatus, Preparation, ACTION_BACKUP_SCHEDULE,
    LABEL_SOURCE_BRANCH, LABEL_TARGET_BRANCH, STATUS_RUNNING_JOBS,
};
use crate::services::{build_job_path, provisioning_job_path, ServiceError};
use crate::values::{merge_documents, VALUES_LOCATION};

const WORKSPACE_PURPOSE: &str = "merge-requests";
const ORIGIN: &str = "origin";

/// Pending actions this controller knows how to run.
const RECOGNIZED_ACTIONS: &[&str] = &[ACTION_BACKUP_SCHEDULE];

/// What a merge request needs next, decoded from its labels, annotations and status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeRequestState {
    /// Branch promotion has not run yet.
    Unprepared,
    /// The change exists and is marked for automatic approval.
    AwaitingApproval,
    /// Merged with a follow-up action still queued.
    PendingProvision { action: String },
    /// Open change: wait for builds, then replay cached edits.
    Open,
    Settled,
}

impl MergeRequestState {
    pub fn decode(mr: &MergeRequest) -> Result<Self, ReconcileError> {
        let status = &mr.status;

        if mr.is_branch_merge()
            && mr.spec.source_branch.is_empty()
            && status.change_id.is_empty()
            && status.preparation == Preparation::Pending
        {
            return Ok(Self::Unprepared);
        }

        if !status.change_id.is_empty()
            && status.value == MergeStatus::New
            && mr.is_auto_approved()
        {
            return Ok(Self::AwaitingApproval);
        }

        if status.value == MergeStatus::Merged {
            let actions = mr.pending_actions().map_err(|e| {
                ReconcileError::configuration(format!("malformed pending actions annotation: {e}"))
            })?;
            if let Some(action) = actions
                .into_iter()
                .find(|a| RECOGNIZED_ACTIONS.contains(&a.as_str()))
            {
                return Ok(Self::PendingProvision { action });
            }
        }

        if status.value == MergeStatus::New {
            return Ok(Self::Open);
        }

        Ok(Self::Settled)
    }
}

/// Reconciles merge requests one at a time.
///
/// Branch promotion rewrites shared remote branches by name, so passes are
/// serialized even when the runner would allow more concurrency.
pub struct MergeRequestController {
    ctx: ControllerContext,
    reconcile_lock: Mutex<()>,
}

impl MergeRequestController {
    pub fn new(ctx: ControllerContext) -> Self {
        Self {
            ctx,
            reconcile_lock: Mutex::new(()),
        }
    }

    async fn reconcile_merge_request(&self, name: &str) -> Result<Outcome, ReconcileError> {
        let Some(mr) = self
            .ctx
            .store
            .get_merge_request(name)
            .await
            .context("unable to get merge request")?
        else {
            info!("merge request not found");
            return Ok(Outcome::Done);
        };

        let state = MergeRequestState::decode(&mr)?;
        debug!(?state, "decoded merge request state");

        match state {
            MergeRequestState::Unprepared => self.prepare_branch(&mr).await,
            MergeRequestState::AwaitingApproval => self.approve(&mr).await,
            MergeRequestState::PendingProvision { action } => {
                self.trigger_provisioning(&mr, &action).await
            }
            MergeRequestState::Open => match self.gate_builds(&mr).await? {
                Outcome::Done => self.replay_cached_files(&mr).await,
                postponed => Ok(postponed),
            },
            MergeRequestState::Settled => Ok(Outcome::Done),
        }
    }

    /// Rebuilds the source branch on top of the target branch, keeping the
    /// source branch's files and merging both values documents.
    async fn prepare_branch(&self, mr: &MergeRequest) -> Result<Outcome, ReconcileError> {
        let target = mr
            .metadata
            .label(LABEL_TARGET_BRANCH)
            .ok_or_else(|| ReconcileError::configuration("target branch is not specified"))?;
        let source = mr
            .metadata
            .label(LABEL_SOURCE_BRANCH)
            .ok_or_else(|| ReconcileError::configuration("source branch is not specified"))?;
        let project = mr.spec.project_name.as_str();

        info!(source_branch = source, target_branch = target, "preparing branch");

        let ws = self.clone_project(project).await?;

        ws.checkout(target, false)
            .await
            .context("unable to checkout target branch")?;
        let target_values = ws
            .read_file(VALUES_LOCATION)
            .context("unable to back up values document")?;

        ws.checkout(source, false)
            .await
            .context("unable to checkout source branch")?;
        let backup = ws
            .scratch_dir("source-tree")
            .context("unable to create backup folder")?;
        ws.export_tree(&backup)
            .context("unable to back up source branch")?;

        ws.checkout(target, false)
            .await
            .context("unable to checkout target branch")?;
        ws.delete_branch(source)
            .await
            .context("unable to delete source branch")?;
        ws.checkout(source, true)
            .await
            .context("unable to recreate source branch")?;
        ws.import_tree(&backup)
            .context("unable to restore source branch")?;

        match (target_values, ws.read_file(VALUES_LOCATION)) {
            (Some(base), Ok(Some(restored))) => {
                let merged =
                    merge_documents(&restored, &base).context("unable to merge values")?;
                ws.write_file(VALUES_LOCATION, &merged)
                    .context("unable to write merged values")?;
            }
            (_, Err(e)) => return Err(e).context("unable to read restored values"),
            _ => debug!("no values document to merge"),
        }

        ws.add(".").await.context("unable to add all files")?;

        let change = change_id(&format!("{project}/{source}/{target}"));
        let message = with_change_id(
            &format!("Add new branch {source}\n\nupdate branch values.yaml from [{target}] branch"),
            &change,
        );
        let committed = ws
            .commit(&mr.author(), &message, &[])
            .await
            .context("unable to commit changes")?;
        debug!(?committed, "branch preparation commit");

        let refspec = format!("refs/heads/{source}:refs/heads/{source}");
        ws.push(ORIGIN, &[&refspec, "--force"])
            .await
            .context("unable to push source branch")?;

        self.mark_prepared(mr, source).await
    }

    /// Records the resolved source branch, provided nobody touched the
    /// resource since this pass read it.
    async fn mark_prepared(&self, mr: &MergeRequest, source: &str) -> Result<Outcome, ReconcileError> {
        let Some(mut live) = self
            .ctx
            .store
            .get_merge_request(mr.name())
            .await
            .context("unable to reload merge request")?
        else {
            info!("merge request deleted during preparation");
            return Ok(Outcome::Done);
        };

        if live.metadata.resource_version != mr.metadata.resource_version {
            return Err(ServiceError::Conflict {
                kind: "MergeRequest",
                name: mr.name().to_string(),
            })
            .context("merge request changed during preparation");
        }

        live.spec.source_branch = source.to_string();
        live.status.preparation = Preparation::Prepared;
        self.ctx
            .store
            .update_merge_request(&live)
            .await
            .context("unable to mark merge request prepared")?;

        info!(source_branch = source, "branch prepared");
        Ok(Outcome::Done)
    }

    async fn approve(&self, mr: &MergeRequest) -> Result<Outcome, ReconcileError> {
        self.ctx
            .review
            .approve_and_submit(&mr.status.change_id, &mr.author())
            .await
            .context("unable to approve and submit change")?;

        let mut updated = mr.clone();
        updated.status.value = MergeStatus::Merged;
        self.ctx
            .store
            .update_merge_request(&updated)
            .await
            .context("unable to update merge request status")?;

        info!(change_id = %mr.status.change_id, "change approved");
        Ok(Outcome::Done)
    }

    async fn trigger_provisioning(
        &self,
        mr: &MergeRequest,
        action: &str,
    ) -> Result<Outcome, ReconcileError> {
        let codebase = self.registry(&mr.spec.project_name).await?;
        let job = codebase
            .spec
            .job_provisioning
            .as_deref()
            .filter(|j| !j.is_empty())
            .ok_or_else(|| ReconcileError::configuration("project has no job provisioning"))?;

        let params = provisioning_params(&self.ctx, &codebase);
        self.ctx
            .ci
            .trigger_job(&provisioning_job_path(job), &params)
            .await
            .context("unable to trigger provisioning job")?;

        let actions = mr
            .pending_actions()
            .map_err(|e| ReconcileError::configuration(format!("malformed pending actions annotation: {e}")))?;
        let mut updated = mr.clone();
        updated
            .set_pending_actions(&remove_action(&actions, action))
            .context("unable to encode pending actions")?;
        self.ctx
            .store
            .update_merge_request(&updated)
            .await
            .context("unable to update merge request actions")?;

        info!(action, job, "provisioning job triggered");
        Ok(Outcome::Done)
    }

    /// Postpones while any registry branch build has not succeeded.
    async fn gate_builds(&self, mr: &MergeRequest) -> Result<Outcome, ReconcileError> {
        let project = mr.spec.project_name.as_str();
        let mut codebase = self.registry(project).await?;
        let branches = self
            .ctx
            .store
            .list_codebase_branches(project)
            .await
            .context("unable to list registry branches")?;

        let mut running = Vec::new();
        for branch in &branches {
            let path = build_job_path(project, &branch.spec.branch_name);
            match self.ctx.ci.job_status(&path).await {
                Ok(status) if status.is_success() => {}
                Ok(status) => running.push((branch.spec.branch_name.clone(), status)),
                Err(e) if e.is_not_found() => debug!(job = %path, "build job not found"),
                Err(e) => return Err(e).context("unable to get build status"),
            }
        }

        if !running.is_empty() {
            info!(?running, "registry builds not finished, postponing");
            if codebase.status_marker() != Some(STATUS_RUNNING_JOBS) {
                codebase.set_status_marker(STATUS_RUNNING_JOBS);
                self.ctx
                    .store
                    .update_codebase(&codebase)
                    .await
                    .context("unable to mark running jobs")?;
            }
            return Ok(Outcome::RetryAfter(self.ctx.settings.postpone_delay()));
        }

        if codebase.clear_status_marker(STATUS_RUNNING_JOBS) {
            self.ctx
                .store
                .update_codebase(&codebase)
                .await
                .context("unable to clear running jobs marker")?;
            info!("registry builds finished");
        }
        Ok(Outcome::Done)
    }

    /// Adds cached edits made after submission to the open change as a new patch set.
    /// The registry's cached entries are cleared afterwards, whether or not anything changed.
    async fn replay_cached_files(&self, mr: &MergeRequest) -> Result<Outcome, ReconcileError> {
        let project = mr.spec.project_name.as_str();
        if mr.status.change_id.is_empty() || !self.ctx.cached_files.has_entries(project) {
            return Ok(Outcome::Done);
        }

        let change = self
            .ctx
            .review
            .change_details(&mr.status.change_id)
            .await
            .context("unable to get change details")?;
        let revision = change
            .current_revision()
            .filter(|r| !r.git_ref.is_empty())
            .ok_or_else(|| ServiceError::NotFound {
                kind: "revision",
                name: mr.status.change_id.clone(),
            })
            .context("change has no patch set")?;
        let message = if revision.commit_message.is_empty() {
            format!("edit registry\n\nChange-Id: {}", mr.status.change_id)
        } else {
            revision.commit_message.clone()
        };

        let ws = self.clone_project(project).await?;
        ws.fetch(ORIGIN, &revision.git_ref)
            .await
            .context("unable to fetch change")?;
        ws.reset_hard("FETCH_HEAD")
            .await
            .context("unable to check out change")?;

        let changed = apply_cached_files(&self.ctx.cached_files, project, &ws)
            .await
            .context("unable to apply cached files")?;

        if changed {
            ws.commit(&mr.author(), &message, &["--amend"])
                .await
                .context("unable to amend change")?;
            let refspec = review_refspec(mr.target_branch());
            ws.push(ORIGIN, &[&refspec, "--force"])
                .await
                .context("unable to push change")?;
            info!(change_id = %mr.status.change_id, "cached files added to change");
        }

        self.ctx
            .cached_files
            .clear(project)
            .context("unable to clear cached files")?;
        Ok(Outcome::Done)
    }

    async fn clone_project(&self, project: &str) -> Result<GitWorkspace, ReconcileError> {
        let ws = self.ctx.open_workspace(WORKSPACE_PURPOSE, project).await?;
        ws.clone_from(&self.ctx.settings.git_remote_url(project))
            .await
            .context("unable to clone repo")?;
        Ok(ws)
    }

    async fn registry(&self, project: &str) -> Result<Codebase, ReconcileError> {
        self.ctx
            .store
            .get_codebase(project)
            .await
            .context("unable to get project codebase")?
            .ok_or_else(|| {
                ReconcileError::configuration(format!("registry codebase '{project}' not found"))
            })
    }
}

/// Parameters of the provisioning job run for `codebase`.
fn provisioning_params(ctx: &ControllerContext, codebase: &Codebase) -> BTreeMap<String, String> {
    let settings = &ctx.settings;
    [
        ("NAME", codebase.name().to_string()),
        ("TYPE", codebase.spec.codebase_type.clone()),
        ("BUILD_TOOL", codebase.spec.build_tool.clone()),
        ("BRANCH", codebase.spec.default_branch.clone()),
        ("GIT_SERVER_CR_NAME", codebase.spec.git_server.clone()),
        ("GIT_SERVER_CR_VERSION", settings.ci_git_server_version.clone()),
        ("GIT_CREDENTIALS_ID", settings.ci_git_credentials_id.clone()),
        ("REPOSITORY_PATH", settings.ci_repository_path(codebase.name())),
        ("JIRA_INTEGRATION_ENABLED", "false".to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

#[async_trait]
impl Reconciler for MergeRequestController {
    fn kind(&self) -> &'static str {
        "MergeRequest"
    }

    async fn reconcile(&self, name: &str) -> Result<Outcome, ReconcileError> {
        let _guard = self.reconcile_lock.lock().await;
        let span = info_span!("reconcile", kind = "MergeRequest", name = %name);
        self.reconcile_merge_request(name).instrument(span).await
    }
}
