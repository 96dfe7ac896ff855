//! Registry import: seeds a freshly created registry repository from its
//! template, then keeps the registry postponed until its branches are active.

use async_trait::async_trait;
use tracing::{debug, info, info_span, Instrument};

use super::{Context, ControllerContext, Outcome, ReconcileError, Reconciler};
use crate::cached_files::apply_cached_files;
use crate::git::GitWorkspace;
use crate::resource::{Codebase, ANNOTATION_TEMPLATE_NAME, ANNOTATION_VALUES, STATUS_INACTIVE_BRANCHES};
use crate::values::{merge_values, parse_override_patch, parse_values, render_values, VALUES_LOCATION};
use crate::version::{branch_version, lowest_version, update_branches, Version, VersionFilter};

const WORKSPACE_PURPOSE: &str = "codebases";
const REGISTRY_REMOTE: &str = "registry";
const REGISTRY_BASE_BRANCH: &str = "master";
const IMPORT_COMMIT_MESSAGE: &str = "set initial values.yaml from admin console";

/// How pulling the registry's own history into the template clone went.
enum PullResult {
    Merged,
    /// The registry repository is brand new.
    EmptyRegistry,
    /// The registry already holds unrelated content; leave it untouched.
    Diverged,
}

/// Reconciles registry codebases. Every pass works in its own workspace, so
/// several codebases may be reconciled at once.
pub struct CodebaseController {
    ctx: ControllerContext,
    filter: VersionFilter,
}

impl CodebaseController {
    pub fn new(ctx: ControllerContext) -> Result<Self, ReconcileError> {
        let filter = ctx
            .settings
            .version_filter()
            .map_err(|e| ReconcileError::configuration(e.to_string()))?;
        Ok(Self { ctx, filter })
    }

    async fn reconcile_codebase(&self, name: &str) -> Result<Outcome, ReconcileError> {
        let Some(mut codebase) = self
            .ctx
            .store
            .get_codebase(name)
            .await
            .context("unable to get codebase")?
        else {
            info!("codebase not found");
            return Ok(Outcome::Done);
        };

        if !codebase.is_registry() {
            debug!(codebase_type = %codebase.spec.codebase_type, "not a registry, skipping");
            return Ok(Outcome::Done);
        }

        if !self.filter.is_permissive() {
            let version = self.registry_version(&codebase).await?;
            if !self.filter.accepts(&version) {
                info!(%version, filter = %self.filter, "registry version filtered out");
                return Ok(Outcome::Done);
            }
        }

        if codebase.awaiting_import() {
            match self.import(&codebase).await? {
                Some(imported) => codebase = imported,
                None => return Ok(Outcome::RetryAfter(self.ctx.settings.postpone_delay())),
            }
        }

        self.gate_branches(codebase).await
    }

    /// Version of the registry: the highest of its configured branch and the
    /// source branches of merged version updates. Falls back to its oldest
    /// update branch when none of those carries a version.
    async fn registry_version(&self, codebase: &Codebase) -> Result<Version, ReconcileError> {
        let merged_updates = self
            .ctx
            .store
            .merge_requests_by_project(codebase.name())
            .await
            .context("unable to list registry merge requests")?;
        let version = merged_updates
            .iter()
            .filter(|mr| mr.is_merged_version_update())
            .map(|mr| branch_version(&mr.spec.source_branch))
            .fold(branch_version(codebase.version_branch()), Version::max);
        if !version.is_lowest() {
            return Ok(version);
        }

        let project = self
            .ctx
            .review
            .get_project(codebase.name())
            .await
            .context("unable to get review project")?;
        Ok(project
            .map(|p| lowest_version(&update_branches(&p.branches)))
            .unwrap_or_else(Version::lowest))
    }

    /// Pushes the template into the registry repository. Returns `None` when
    /// the review project is not ready yet, otherwise the persisted codebase.
    async fn import(&self, codebase: &Codebase) -> Result<Option<Codebase>, ReconcileError> {
        let name = codebase.name();
        let project = self
            .ctx
            .review
            .get_project(name)
            .await
            .context("unable to get review project")?;
        match project {
            Some(p) if p.is_ready() => {}
            Some(p) => {
                info!(status = %p.status, "review project not ready, postponing");
                return Ok(None);
            }
            None => {
                info!("review project not found, postponing");
                return Ok(None);
            }
        }

        let template = codebase
            .metadata
            .annotation(ANNOTATION_TEMPLATE_NAME)
            .ok_or_else(|| ReconcileError::configuration("registry template is not specified"))?;

        let ws = self.ctx.open_workspace(WORKSPACE_PURPOSE, name).await?;
        ws.clone_from(&self.ctx.settings.git_remote_url(template))
            .await
            .context("unable to clone template")?;
        ws.add_remote(REGISTRY_REMOTE, &self.ctx.settings.git_remote_url(name))
            .await
            .context("unable to add registry remote")?;

        match self.pull_registry(&ws).await? {
            PullResult::Diverged => {
                info!("registry repository already has content, skipping template push");
            }
            result => {
                if let PullResult::EmptyRegistry = result {
                    self.replace_default_branch(&ws, codebase).await?;
                }
                self.push_template(&ws, codebase).await?;
            }
        }

        let mut updated = codebase.clone();
        updated.spec.git_url_path = Some(format!("/{name}"));
        let updated = self
            .ctx
            .store
            .update_codebase(&updated)
            .await
            .context("unable to update codebase git path")?;

        info!("registry imported");
        Ok(Some(updated))
    }

    async fn pull_registry(&self, ws: &GitWorkspace) -> Result<PullResult, ReconcileError> {
        match ws.pull(REGISTRY_REMOTE, REGISTRY_BASE_BRANCH).await {
            Ok(()) => Ok(PullResult::Merged),
            Err(e) if e.is_reference_not_found() => Ok(PullResult::EmptyRegistry),
            Err(e) if e.is_non_fast_forward() => Ok(PullResult::Diverged),
            Err(e) => Err(e).context("unable to pull registry"),
        }
    }

    /// Checks out the default branch, rebuilding it from the copy branch when one is set.
    async fn replace_default_branch(
        &self,
        ws: &GitWorkspace,
        codebase: &Codebase,
    ) -> Result<(), ReconcileError> {
        let default = codebase.spec.default_branch.as_str();
        match codebase.spec.branch_to_copy_in_default_branch.as_deref() {
            Some(copy) if !copy.is_empty() => {
                ws.checkout(copy, false)
                    .await
                    .context("unable to checkout branch to copy")?;
                ws.delete_branch(default)
                    .await
                    .context("unable to delete default branch")?;
                ws.checkout(default, true)
                    .await
                    .context("unable to recreate default branch")?;
                debug!(copy, default, "default branch replaced");
            }
            _ => ws
                .checkout(default, false)
                .await
                .context("unable to checkout default branch")?,
        }
        Ok(())
    }

    async fn push_template(&self, ws: &GitWorkspace, codebase: &Codebase) -> Result<(), ReconcileError> {
        let name = codebase.name();
        let mut changed = apply_cached_files(&self.ctx.cached_files, name, ws)
            .await
            .context("unable to apply cached files")?;
        changed |= self.apply_values_patch(ws, codebase).await?;

        if changed {
            ws.commit(&codebase.creator(), IMPORT_COMMIT_MESSAGE, &[])
                .await
                .context("unable to commit registry values")?;
        }

        ws.push(REGISTRY_REMOTE, &["--all"])
            .await
            .context("unable to push branches")?;
        ws.push(REGISTRY_REMOTE, &["--tags"])
            .await
            .context("unable to push tags")?;
        Ok(())
    }

    /// Merges the registry's values patch into the values document.
    /// Returns whether the document changed.
    async fn apply_values_patch(
        &self,
        ws: &GitWorkspace,
        codebase: &Codebase,
    ) -> Result<bool, ReconcileError> {
        let patch = parse_override_patch(
            codebase.metadata.annotation(ANNOTATION_VALUES).unwrap_or_default(),
        )
        .map_err(|e| ReconcileError::configuration(format!("malformed registry values: {e}")))?;
        if patch.is_empty() {
            return Ok(false);
        }

        let current = ws
            .read_file(VALUES_LOCATION)
            .context("unable to read values")?
            .unwrap_or_default();
        let current = parse_values(&current).context("unable to parse values")?;
        let merged = merge_values(&patch, &current);
        if merged == current {
            return Ok(false);
        }

        let rendered = render_values(&merged).context("unable to render values")?;
        ws.write_file(VALUES_LOCATION, &rendered)
            .context("unable to write values")?;
        ws.add(VALUES_LOCATION)
            .await
            .context("unable to add values")?;
        Ok(true)
    }

    /// Postpones while any branch of the registry is not active yet.
    async fn gate_branches(&self, mut codebase: Codebase) -> Result<Outcome, ReconcileError> {
        let branches = self
            .ctx
            .store
            .list_codebase_branches(codebase.name())
            .await
            .context("unable to list codebase branches")?;

        let inactive: Vec<&str> = branches
            .iter()
            .filter(|b| !b.is_active())
            .map(|b| b.spec.branch_name.as_str())
            .collect();

        if !inactive.is_empty() {
            info!(?inactive, "registry branches not active, postponing");
            if codebase.status_marker() != Some(STATUS_INACTIVE_BRANCHES) {
                codebase.set_status_marker(STATUS_INACTIVE_BRANCHES);
                self.ctx
                    .store
                    .update_codebase(&codebase)
                    .await
                    .context("unable to mark inactive branches")?;
            }
            return Ok(Outcome::RetryAfter(self.ctx.settings.default_retry()));
        }

        if codebase.clear_status_marker(STATUS_INACTIVE_BRANCHES) {
            self.ctx
                .store
                .update_codebase(&codebase)
                .await
                .context("unable to clear inactive branches marker")?;
        }
        Ok(Outcome::Done)
    }
}

#[async_trait]
impl Reconciler for CodebaseController {
    fn kind(&self) -> &'static str {
        "Codebase"
    }

    async fn reconcile(&self, name: &str) -> Result<Outcome, ReconcileError> {
        let span = info_span!("reconcile", kind = "Codebase", name = %name);
        self.reconcile_codebase(name).instrument(span).await
    }
}
