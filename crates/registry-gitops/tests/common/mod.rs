//! Shared fakes and git fixtures for the controller integration tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use registry_gitops::resource::{
    CodebaseBranchSpec, CodebaseBranchStatus, CodebaseSpec, MergeRequestSpec, ACTION_BRANCH_MERGE,
    ANNOTATION_CREATOR_EMAIL, ANNOTATION_CREATOR_USERNAME, LABEL_ACTION, LABEL_SOURCE_BRANCH,
    LABEL_TARGET_BRANCH,
};
use registry_gitops::services::{ChangeDetails, JobStatus, ReviewProject};
use registry_gitops::{
    CiService, Codebase, CodebaseBranch, ControllerContext, GitUser, MergeRequest, ObjectMeta,
    ResourceStore, ReviewService, ServiceError, Settings,
};
use secrecy::SecretString;
use tempfile::TempDir;

#[derive(Default)]
struct StoreState {
    merge_requests: HashMap<String, MergeRequest>,
    codebases: HashMap<String, Codebase>,
    branches: HashMap<String, Vec<CodebaseBranch>>,
    revision: u64,
}

impl StoreState {
    fn next_version(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }
}

/// In-memory resource store with resource-version fencing.
#[derive(Default)]
pub struct FakeStore {
    state: Mutex<StoreState>,
}

impl FakeStore {
    pub fn put_merge_request(&self, mut mr: MergeRequest) {
        let mut state = self.state.lock().unwrap();
        mr.metadata.resource_version = state.next_version();
        state.merge_requests.insert(mr.metadata.name.clone(), mr);
    }

    pub fn merge_request(&self, name: &str) -> MergeRequest {
        self.state.lock().unwrap().merge_requests[name].clone()
    }

    pub fn put_codebase(&self, mut codebase: Codebase) {
        let mut state = self.state.lock().unwrap();
        codebase.metadata.resource_version = state.next_version();
        state
            .codebases
            .insert(codebase.metadata.name.clone(), codebase);
    }

    pub fn codebase(&self, name: &str) -> Codebase {
        self.state.lock().unwrap().codebases[name].clone()
    }

    pub fn set_branches(&self, codebase: &str, branches: Vec<CodebaseBranch>) {
        self.state
            .lock()
            .unwrap()
            .branches
            .insert(codebase.to_string(), branches);
    }
}

#[async_trait]
impl ResourceStore for FakeStore {
    async fn get_merge_request(&self, name: &str) -> Result<Option<MergeRequest>, ServiceError> {
        Ok(self.state.lock().unwrap().merge_requests.get(name).cloned())
    }

    async fn update_merge_request(
        &self,
        merge_request: &MergeRequest,
    ) -> Result<MergeRequest, ServiceError> {
        let mut state = self.state.lock().unwrap();
        let name = merge_request.metadata.name.clone();
        let current = state
            .merge_requests
            .get(&name)
            .ok_or_else(|| ServiceError::NotFound {
                kind: "MergeRequest",
                name: name.clone(),
            })?;
        if current.metadata.resource_version != merge_request.metadata.resource_version {
            return Err(ServiceError::Conflict {
                kind: "MergeRequest",
                name,
            });
        }
        let mut updated = merge_request.clone();
        updated.metadata.resource_version = state.next_version();
        state.merge_requests.insert(name, updated.clone());
        Ok(updated)
    }

    async fn merge_requests_by_project(
        &self,
        project: &str,
    ) -> Result<Vec<MergeRequest>, ServiceError> {
        let state = self.state.lock().unwrap();
        let mut found: Vec<MergeRequest> = state
            .merge_requests
            .values()
            .filter(|mr| mr.spec.project_name == project)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(found)
    }

    async fn get_codebase(&self, name: &str) -> Result<Option<Codebase>, ServiceError> {
        Ok(self.state.lock().unwrap().codebases.get(name).cloned())
    }

    async fn update_codebase(&self, codebase: &Codebase) -> Result<Codebase, ServiceError> {
        let mut state = self.state.lock().unwrap();
        let name = codebase.metadata.name.clone();
        let current = state
            .codebases
            .get(&name)
            .ok_or_else(|| ServiceError::NotFound {
                kind: "Codebase",
                name: name.clone(),
            })?;
        if current.metadata.resource_version != codebase.metadata.resource_version {
            return Err(ServiceError::Conflict {
                kind: "Codebase",
                name,
            });
        }
        let mut updated = codebase.clone();
        updated.metadata.resource_version = state.next_version();
        state.codebases.insert(name, updated.clone());
        Ok(updated)
    }

    async fn list_codebase_branches(
        &self,
        codebase: &str,
    ) -> Result<Vec<CodebaseBranch>, ServiceError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .branches
            .get(codebase)
            .cloned()
            .unwrap_or_default())
    }

    async fn secret_value(&self, _secret: &str, _key: &str) -> Result<SecretString, ServiceError> {
        Ok(SecretString::from("test-private-key".to_string()))
    }
}

#[derive(Default)]
pub struct FakeReview {
    projects: Mutex<HashMap<String, ReviewProject>>,
    changes: Mutex<HashMap<String, ChangeDetails>>,
    pub approvals: Mutex<Vec<(String, GitUser)>>,
}

impl FakeReview {
    pub fn put_project(&self, name: &str, status: &str, branches: &[&str]) {
        self.projects.lock().unwrap().insert(
            name.to_string(),
            ReviewProject {
                name: name.to_string(),
                status: status.to_string(),
                branches: branches.iter().map(|b| b.to_string()).collect(),
            },
        );
    }

    pub fn put_change(&self, change: ChangeDetails) {
        self.changes
            .lock()
            .unwrap()
            .insert(change.change_id.clone(), change);
    }
}

#[async_trait]
impl ReviewService for FakeReview {
    async fn get_project(&self, name: &str) -> Result<Option<ReviewProject>, ServiceError> {
        Ok(self.projects.lock().unwrap().get(name).cloned())
    }

    async fn change_details(&self, change_id: &str) -> Result<ChangeDetails, ServiceError> {
        self.changes
            .lock()
            .unwrap()
            .get(change_id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound {
                kind: "change",
                name: change_id.to_string(),
            })
    }

    async fn approve_and_submit(
        &self,
        change_id: &str,
        author: &GitUser,
    ) -> Result<(), ServiceError> {
        self.approvals
            .lock()
            .unwrap()
            .push((change_id.to_string(), author.clone()));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeCi {
    statuses: Mutex<HashMap<String, JobStatus>>,
    pub triggers: Mutex<Vec<(String, BTreeMap<String, String>)>>,
}

impl FakeCi {
    pub fn set_status(&self, job_path: &str, result: &str) {
        self.statuses.lock().unwrap().insert(
            job_path.to_string(),
            JobStatus {
                result: result.to_string(),
                build: 1,
            },
        );
    }
}

#[async_trait]
impl CiService for FakeCi {
    async fn job_status(&self, job_path: &str) -> Result<JobStatus, ServiceError> {
        self.statuses
            .lock()
            .unwrap()
            .get(job_path)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound {
                kind: "job",
                name: job_path.to_string(),
            })
    }

    async fn trigger_job(
        &self,
        job_path: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<(), ServiceError> {
        self.triggers
            .lock()
            .unwrap()
            .push((job_path.to_string(), params.clone()));
        Ok(())
    }
}

/// Runs git in `dir`, panicking on failure, and returns its stdout.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .current_dir(dir)
        .args(args)
        .env("GIT_AUTHOR_NAME", "Seed")
        .env("GIT_AUTHOR_EMAIL", "seed@example.com")
        .env("GIT_COMMITTER_NAME", "Seed")
        .env("GIT_COMMITTER_EMAIL", "seed@example.com")
        .output()
        .unwrap();
    assert!(output.status.success(), "git {:?} failed: {:?}", args, output);
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn write_files(dir: &Path, files: &[(&str, &str)]) {
    for (path, content) in files {
        let target = dir.join(path);
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(target, content).unwrap();
    }
}

/// Bare remotes plus the settings and services that point the controllers at them.
pub struct Fixture {
    pub dir: TempDir,
    pub settings: Settings,
    pub store: Arc<FakeStore>,
    pub review: Arc<FakeReview>,
    pub ci: Arc<FakeCi>,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("remotes")).unwrap();
        std::fs::create_dir_all(dir.path().join("seeds")).unwrap();

        let settings = Settings {
            temp_folder: dir.path().join("work"),
            git_base_url: Some(dir.path().join("remotes").to_string_lossy().to_string()),
            default_retry_secs: 30,
            postpone_secs: 3,
            ..Settings::default()
        };

        Self {
            dir,
            settings,
            store: Arc::new(FakeStore::default()),
            review: Arc::new(FakeReview::default()),
            ci: Arc::new(FakeCi::default()),
        }
    }

    pub fn context(&self) -> ControllerContext {
        let store: Arc<dyn ResourceStore> = self.store.clone();
        let review: Arc<dyn ReviewService> = self.review.clone();
        let ci: Arc<dyn CiService> = self.ci.clone();
        ControllerContext::new(self.settings.clone(), store, review, ci)
    }

    pub fn remote(&self, name: &str) -> PathBuf {
        self.dir.path().join("remotes").join(name)
    }

    fn seed(&self, name: &str) -> PathBuf {
        self.dir.path().join("seeds").join(name)
    }

    /// Creates remote `name` whose `master` holds `files`.
    pub fn create_remote(&self, name: &str, files: &[(&str, &str)]) {
        let seed = self.seed(name);
        std::fs::create_dir_all(&seed).unwrap();
        git(&seed, &["init", "-q", "-b", "master"]);
        write_files(&seed, files);
        git(&seed, &["add", "--all"]);
        git(&seed, &["-c", "commit.gpgsign=false", "commit", "-q", "-m", "initial"]);

        let remote = self.remote(name);
        git(
            self.dir.path(),
            &[
                "clone",
                "-q",
                "--bare",
                seed.to_str().unwrap(),
                remote.to_str().unwrap(),
            ],
        );
        git(&seed, &["remote", "add", "origin", remote.to_str().unwrap()]);
    }

    /// Creates an empty bare remote, as the review system does for a new project.
    pub fn create_empty_remote(&self, name: &str) {
        let remote = self.remote(name);
        std::fs::create_dir_all(&remote).unwrap();
        git(&remote, &["init", "-q", "--bare", "-b", "master"]);
    }

    /// Commits `files` on `branch` (created from `from` when new) and pushes it.
    pub fn commit(&self, name: &str, branch: &str, from: &str, files: &[(&str, &str)]) {
        let seed = self.seed(name);
        let exists = Command::new("git")
            .current_dir(&seed)
            .args(["rev-parse", "--verify", "--quiet", &format!("refs/heads/{branch}")])
            .status()
            .unwrap()
            .success();
        if exists {
            git(&seed, &["checkout", "-q", branch]);
        } else {
            git(&seed, &["checkout", "-q", "-b", branch, from]);
        }
        write_files(&seed, files);
        git(&seed, &["add", "--all"]);
        git(
            &seed,
            &["-c", "commit.gpgsign=false", "commit", "-q", "-m", &format!("update {branch}")],
        );
        git(&seed, &["push", "-q", "origin", &format!("{branch}:{branch}")]);
    }

    /// Pushes a commit on top of `from` to an arbitrary reference, as a review change.
    pub fn push_change(&self, name: &str, from: &str, git_ref: &str, message: &str, files: &[(&str, &str)]) {
        let seed = self.seed(name);
        git(&seed, &["checkout", "-q", "--detach", from]);
        write_files(&seed, files);
        git(&seed, &["add", "--all"]);
        git(&seed, &["-c", "commit.gpgsign=false", "commit", "-q", "-m", message]);
        git(&seed, &["push", "-q", "origin", &format!("HEAD:{git_ref}")]);
    }

    /// Reads `path` at `revision` of remote `name`, `None` when absent.
    pub fn read(&self, name: &str, revision: &str, path: &str) -> Option<String> {
        let output = Command::new("git")
            .current_dir(self.remote(name))
            .args(["show", &format!("{revision}:{path}")])
            .output()
            .unwrap();
        output
            .status
            .success()
            .then(|| String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Full names of the branches of remote `name`.
    pub fn branches(&self, name: &str) -> Vec<String> {
        git(
            &self.remote(name),
            &["for-each-ref", "--format=%(refname)", "refs/heads/"],
        )
        .lines()
        .map(str::to_string)
        .collect()
    }

    pub fn is_ancestor(&self, name: &str, ancestor: &str, descendant: &str) -> bool {
        Command::new("git")
            .current_dir(self.remote(name))
            .args(["merge-base", "--is-ancestor", ancestor, descendant])
            .status()
            .unwrap()
            .success()
    }
}

pub fn author() -> GitUser {
    GitUser::new("Registry Admin", "admin@example.com")
}

/// A branch-merge request that has not been prepared yet.
pub fn branch_merge_request(name: &str, project: &str, source: &str, target: &str) -> MergeRequest {
    let author = author();
    let mut mr = MergeRequest::new(
        name,
        MergeRequestSpec {
            project_name: project.to_string(),
            author_name: author.name,
            author_email: author.email,
            ..Default::default()
        },
    );
    mr.metadata = ObjectMeta::new(name)
        .with_label(LABEL_ACTION, ACTION_BRANCH_MERGE)
        .with_label(LABEL_SOURCE_BRANCH, source)
        .with_label(LABEL_TARGET_BRANCH, target);
    mr
}

/// A registry codebase with the creator annotations set.
pub fn registry(name: &str, spec: CodebaseSpec) -> Codebase {
    let mut codebase = Codebase::new(
        name,
        CodebaseSpec {
            codebase_type: "registry".to_string(),
            ..spec
        },
    );
    codebase.metadata = ObjectMeta::new(name)
        .with_annotation(ANNOTATION_CREATOR_USERNAME, "creator")
        .with_annotation(ANNOTATION_CREATOR_EMAIL, "creator@example.com");
    codebase
}

pub fn codebase_branch(codebase: &str, branch: &str, status: &str) -> CodebaseBranch {
    CodebaseBranch {
        metadata: ObjectMeta::new(format!("{codebase}-{branch}")),
        spec: CodebaseBranchSpec {
            codebase_name: codebase.to_string(),
            branch_name: branch.to_string(),
        },
        status: CodebaseBranchStatus {
            value: status.to_string(),
        },
    }
}

pub fn yaml(content: &str) -> serde_yaml::Value {
    serde_yaml::from_str(content).unwrap()
}
