mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use common::{branch_merge_request, codebase_branch, registry, yaml, Fixture};
use registry_gitops::resource::{
    CodebaseSpec, MergeStatus, ANNOTATION_TEMPLATE_NAME, ANNOTATION_VALUES, LABEL_TARGET,
    REPO_NOT_READY, STATUS_INACTIVE_BRANCHES, TARGET_REGISTRY_VERSION_UPDATE,
};
use registry_gitops::{
    Codebase, CodebaseController, ControllerRunner, Outcome, Reconciler, RunnerOptions,
};

const TEMPLATE_VALUES: &str = "\
global:
  registry:
    name: template
  crunchyPostgres:
    backups:
      postgresql: enabled
";

fn pending_registry(name: &str, values: &str, copy_branch: Option<&str>) -> Codebase {
    let mut codebase = registry(
        name,
        CodebaseSpec {
            default_branch: "master".into(),
            branch_to_copy_in_default_branch: copy_branch.map(str::to_string),
            git_url_path: Some(REPO_NOT_READY.into()),
            ..Default::default()
        },
    );
    codebase.metadata = codebase
        .metadata
        .clone()
        .with_annotation(ANNOTATION_TEMPLATE_NAME, "template")
        .with_annotation(ANNOTATION_VALUES, values);
    codebase
}

fn template(fx: &Fixture) {
    fx.create_remote(
        "template",
        &[
            ("deploy-templates/values.yaml", TEMPLATE_VALUES),
            ("Chart.yaml", "name: registry\n"),
        ],
    );
    fx.commit(
        "template",
        "1.9.0",
        "master",
        &[("deploy-templates/values.yaml", "global:\n  registry:\n    name: from-1.9.0\n")],
    );
}

#[tokio::test]
async fn test_import_seeds_new_registry_from_template() {
    let fx = Fixture::new();
    template(&fx);
    fx.create_empty_remote("registry-b");
    fx.review.put_project("registry-b", "OK", &[]);
    fx.store.put_codebase(pending_registry(
        "registry-b",
        r#"{"global":{"crunchyPostgres":{"backups":{"pgbackrest":"enabled"}}}}"#,
        None,
    ));

    let controller = CodebaseController::new(fx.context()).unwrap();
    assert_eq!(controller.reconcile("registry-b").await.unwrap(), Outcome::Done);

    let branches = fx.branches("registry-b");
    assert!(branches.contains(&"refs/heads/master".to_string()));
    assert!(branches.contains(&"refs/heads/1.9.0".to_string()));
    assert_eq!(
        fx.read("registry-b", "master", "Chart.yaml").as_deref(),
        Some("name: registry\n")
    );

    let values = yaml(&fx.read("registry-b", "master", "deploy-templates/values.yaml").unwrap());
    assert_eq!(values["global"]["registry"]["name"], yaml("template"));
    let backups = &values["global"]["crunchyPostgres"]["backups"];
    assert_eq!(backups["postgresql"], yaml("enabled"));
    assert_eq!(backups["pgbackrest"], yaml("enabled"));

    let author = common::git(
        &fx.remote("registry-b"),
        &["log", "-1", "--format=%an <%ae>%n%s", "refs/heads/master"],
    );
    assert_eq!(
        author.trim_end(),
        "creator <creator@example.com>\nset initial values.yaml from admin console"
    );

    assert_eq!(
        fx.store.codebase("registry-b").spec.git_url_path.as_deref(),
        Some("/registry-b")
    );
}

#[tokio::test]
async fn test_import_commits_cached_files_with_values_once() {
    let fx = Fixture::new();
    template(&fx);
    fx.create_empty_remote("registry-x");
    fx.review.put_project("registry-x", "OK", &[]);
    fx.store.put_codebase(pending_registry(
        "registry-x",
        r#"{"global":{"registry":{"name":"registry-x"}}}"#,
        None,
    ));

    let ctx = fx.context();
    let files = BTreeMap::from([("deploy-templates/extra.yaml".to_string(), "x: 1\n".to_string())]);
    ctx.cached_files
        .stage("registry-x", &fx.dir.path().join("staging"), &files)
        .unwrap();

    let controller = CodebaseController::new(ctx).unwrap();
    assert_eq!(controller.reconcile("registry-x").await.unwrap(), Outcome::Done);

    assert_eq!(
        fx.read("registry-x", "master", "deploy-templates/extra.yaml").as_deref(),
        Some("x: 1\n")
    );
    let values = yaml(&fx.read("registry-x", "master", "deploy-templates/values.yaml").unwrap());
    assert_eq!(values["global"]["registry"]["name"], yaml("registry-x"));

    let remote = fx.remote("registry-x");
    let count = common::git(&remote, &["rev-list", "--count", "refs/heads/master"]);
    assert_eq!(count.trim_end(), "2");
    let head = common::git(&remote, &["log", "-1", "--format=%an%n%s", "refs/heads/master"]);
    assert_eq!(head.trim_end(), "creator\nset initial values.yaml from admin console");
}

#[tokio::test]
async fn test_import_copies_override_branch_into_default() {
    let fx = Fixture::new();
    template(&fx);
    fx.create_empty_remote("registry-c");
    fx.review.put_project("registry-c", "OK", &[]);
    fx.store
        .put_codebase(pending_registry("registry-c", "", Some("1.9.0")));

    let controller = CodebaseController::new(fx.context()).unwrap();
    assert_eq!(controller.reconcile("registry-c").await.unwrap(), Outcome::Done);

    assert_eq!(
        fx.read("registry-c", "master", "deploy-templates/values.yaml").as_deref(),
        Some("global:\n  registry:\n    name: from-1.9.0\n")
    );
    let subject = common::git(
        &fx.remote("registry-c"),
        &["log", "-1", "--format=%s", "refs/heads/master"],
    );
    assert_eq!(subject.trim_end(), "update 1.9.0");
}

#[tokio::test]
async fn test_import_leaves_populated_registry_untouched() {
    let fx = Fixture::new();
    template(&fx);
    fx.create_remote("registry-d", &[("existing.txt", "keep\n")]);
    let before = common::git(&fx.remote("registry-d"), &["rev-parse", "refs/heads/master"]);
    fx.review.put_project("registry-d", "OK", &[]);
    fx.store
        .put_codebase(pending_registry("registry-d", r#"{"a":1}"#, None));

    let controller = CodebaseController::new(fx.context()).unwrap();
    assert_eq!(controller.reconcile("registry-d").await.unwrap(), Outcome::Done);

    let after = common::git(&fx.remote("registry-d"), &["rev-parse", "refs/heads/master"]);
    assert_eq!(before, after);
    assert_eq!(fx.branches("registry-d"), vec!["refs/heads/master".to_string()]);
    assert_eq!(
        fx.store.codebase("registry-d").spec.git_url_path.as_deref(),
        Some("/registry-d")
    );
}

#[tokio::test]
async fn test_import_postpones_until_project_is_ready() {
    let fx = Fixture::new();
    fx.store
        .put_codebase(pending_registry("registry-e", "", None));
    let controller = CodebaseController::new(fx.context()).unwrap();

    assert_eq!(
        controller.reconcile("registry-e").await.unwrap(),
        Outcome::RetryAfter(Duration::from_secs(3))
    );

    fx.review.put_project("registry-e", "CREATING", &[]);
    assert_eq!(
        controller.reconcile("registry-e").await.unwrap(),
        Outcome::RetryAfter(Duration::from_secs(3))
    );
    assert!(fx.store.codebase("registry-e").awaiting_import());
}

#[tokio::test]
async fn test_import_without_template_is_configuration_error() {
    let fx = Fixture::new();
    let mut codebase = pending_registry("registry-f", "", None);
    codebase.metadata.annotations.remove(ANNOTATION_TEMPLATE_NAME);
    fx.store.put_codebase(codebase);
    fx.review.put_project("registry-f", "OK", &[]);

    let controller = CodebaseController::new(fx.context()).unwrap();
    let err = controller.reconcile("registry-f").await.unwrap_err();
    assert!(err.is_configuration(), "unexpected error: {err}");
}

#[tokio::test]
async fn test_inactive_branches_postpone_with_default_retry() {
    let fx = Fixture::new();
    fx.store.put_codebase(registry(
        "registry-g",
        CodebaseSpec {
            default_branch: "master".into(),
            git_url_path: Some("/registry-g".into()),
            ..Default::default()
        },
    ));
    fx.store.set_branches(
        "registry-g",
        vec![
            codebase_branch("registry-g", "master", "active"),
            codebase_branch("registry-g", "1.2.0", "initialized"),
        ],
    );
    let controller = CodebaseController::new(fx.context()).unwrap();

    assert_eq!(
        controller.reconcile("registry-g").await.unwrap(),
        Outcome::RetryAfter(Duration::from_secs(30))
    );
    assert_eq!(
        fx.store.codebase("registry-g").status_marker(),
        Some(STATUS_INACTIVE_BRANCHES)
    );

    fx.store.set_branches(
        "registry-g",
        vec![
            codebase_branch("registry-g", "master", "active"),
            codebase_branch("registry-g", "1.2.0", "active"),
        ],
    );
    assert_eq!(controller.reconcile("registry-g").await.unwrap(), Outcome::Done);
    assert_eq!(fx.store.codebase("registry-g").status_marker(), None);
}

#[tokio::test]
async fn test_non_registry_codebase_is_ignored() {
    let fx = Fixture::new();
    let mut codebase = pending_registry("library", "", None);
    codebase.spec.codebase_type = "library".into();
    fx.store.put_codebase(codebase);

    let controller = CodebaseController::new(fx.context()).unwrap();
    assert_eq!(controller.reconcile("library").await.unwrap(), Outcome::Done);
    assert!(fx.store.codebase("library").awaiting_import());
}

#[tokio::test]
async fn test_version_filter_skips_other_registries() {
    let mut fx = Fixture::new();
    fx.settings.registry_version_filter = ">=2.0.0".into();
    fx.store
        .put_codebase(pending_registry("registry-old", "", Some("1.9.0")));
    fx.store
        .put_codebase(pending_registry("registry-master", "", None));
    fx.review.put_project(
        "registry-master",
        "CREATING",
        &["refs/heads/master", "refs/heads/2.1.0", "refs/heads/2.0.5"],
    );

    let controller = CodebaseController::new(fx.context()).unwrap();

    // 1.9.0 is filtered out before the review project is even looked up.
    assert_eq!(controller.reconcile("registry-old").await.unwrap(), Outcome::Done);
    assert!(fx.store.codebase("registry-old").awaiting_import());

    // A master-based registry takes its version from the oldest update branch.
    assert_eq!(
        controller.reconcile("registry-master").await.unwrap(),
        Outcome::RetryAfter(Duration::from_secs(3))
    );
}

#[tokio::test]
async fn test_merged_version_update_raises_registry_version() {
    let mut fx = Fixture::new();
    fx.settings.registry_version_filter = ">=1.5.0".into();
    let mut codebase = pending_registry("registry-h", "", None);
    codebase.spec.default_branch = "1.2.0".into();
    fx.store.put_codebase(codebase);

    let controller = CodebaseController::new(fx.context()).unwrap();
    assert_eq!(controller.reconcile("registry-h").await.unwrap(), Outcome::Done);
    assert!(fx.store.codebase("registry-h").awaiting_import());

    // An open update does not count until it is merged.
    let mut update = branch_merge_request("update-1-6", "registry-h", "1.6.0", "1.2.0");
    update.metadata = update
        .metadata
        .clone()
        .with_label(LABEL_TARGET, TARGET_REGISTRY_VERSION_UPDATE);
    update.spec.source_branch = "1.6.0".into();
    fx.store.put_merge_request(update.clone());
    assert_eq!(controller.reconcile("registry-h").await.unwrap(), Outcome::Done);

    update.status.value = MergeStatus::Merged;
    fx.store.put_merge_request(update);
    assert_eq!(
        controller.reconcile("registry-h").await.unwrap(),
        Outcome::RetryAfter(Duration::from_secs(3))
    );
}

#[test]
fn test_invalid_version_filter_is_rejected() {
    let mut fx = Fixture::new();
    fx.settings.registry_version_filter = "~1.0".into();
    assert!(CodebaseController::new(fx.context()).is_err());
}

#[tokio::test]
async fn test_runner_counts_postponement_separately_from_failure() {
    let fx = Fixture::new();
    fx.store
        .put_codebase(pending_registry("registry-e", "", None));
    let controller = CodebaseController::new(fx.context()).unwrap();
    let runner = ControllerRunner::new(
        controller,
        RunnerOptions::new(fx.settings.codebase_workers, fx.settings.default_retry()),
    );

    assert_eq!(
        runner.process("registry-e").await,
        Some(Duration::from_secs(3))
    );

    let stats = runner.stats();
    assert_eq!(stats.postponed(), 1);
    assert_eq!(stats.failed(), 0);
    assert_eq!(stats.reconciled(), 0);
}
