//! Disposable git working copies driven through the git CLI.

use std::path::{Component, Path, PathBuf};
use std::process::{Output, Stdio};

use tempfile::TempDir;
use tokio::process::Command;
use walkdir::WalkDir;

use super::auth::{GitCredentials, SshKeyFile};
use super::error::{GitError, Result};
use super::parse::{classify_git_error, format_git_error, is_nothing_to_commit, parse_ref_list};
use super::types::{CommitOutcome, GitUser};

const GIT_DIR: &str = ".git";

/// A private working copy living in its own temporary directory.
///
/// The directory, the checkout and the ssh key file are all removed when
/// the workspace is dropped, whichever way the reconcile pass ends.
#[derive(Debug)]
pub struct GitWorkspace {
    repo_path: PathBuf,
    user: String,
    key: SshKeyFile,
    root: TempDir,
}

impl GitWorkspace {
    /// Creates an empty workspace named `name` below `base_dir`.
    pub fn create(base_dir: &Path, name: &str, credentials: &GitCredentials) -> Result<Self> {
        if name.is_empty()
            || name.contains(['/', '\\'])
            || name == "."
            || name == ".."
        {
            return Err(GitError::InvalidName(name.to_string()));
        }

        std::fs::create_dir_all(base_dir).map_err(|source| GitError::Workspace {
            path: base_dir.to_path_buf(),
            source,
        })?;
        let root = tempfile::Builder::new()
            .prefix(&format!("{}-", name))
            .tempdir_in(base_dir)
            .map_err(|source| GitError::Workspace {
                path: base_dir.to_path_buf(),
                source,
            })?;

        let key = SshKeyFile::write(root.path(), &credentials.private_key)?;
        let repo_path = root.path().join(name);

        log::debug!("Created git workspace at {}", repo_path.display());

        Ok(Self {
            repo_path,
            user: credentials.user.clone(),
            key,
            root,
        })
    }

    /// Returns the working copy path.
    pub fn path(&self) -> &Path {
        &self.repo_path
    }

    /// Scratch directory next to the working copy, removed with the workspace.
    pub fn scratch_dir(&self, name: &str) -> Result<PathBuf> {
        let dir = self.root.path().join(format!("scratch-{}", name));
        std::fs::create_dir_all(&dir).map_err(|source| GitError::Workspace {
            path: dir.clone(),
            source,
        })?;
        Ok(dir)
    }

    /// Clones every reference of `url` and checks out the default branch.
    ///
    /// The clone is taken as a mirror and converted into a regular working
    /// copy, so all remote branches exist locally afterwards.
    pub async fn clone_from(&self, url: &str) -> Result<()> {
        let git_dir = self.repo_path.join(GIT_DIR);
        let git_dir = git_dir.to_string_lossy();
        self.execute(
            self.root.path(),
            "clone",
            &["clone", "--mirror", url, git_dir.as_ref()],
            true,
        )
        .await?;

        self.git(
            "clone",
            &["--git-dir", GIT_DIR, "config", "--bool", "core.bare", "false"],
        )
        .await?;
        self.git(
            "clone",
            &["--git-dir", GIT_DIR, "config", "--bool", "remote.origin.mirror", "false"],
        )
        .await?;
        self.git("clone", &["reset", "--hard"]).await?;

        log::info!("Cloned {} into {}", url, self.repo_path.display());
        Ok(())
    }

    pub async fn add_remote(&self, name: &str, url: &str) -> Result<()> {
        self.git("remote add", &["remote", "add", name, url]).await?;
        Ok(())
    }

    /// Checks out `branch`, creating it from `HEAD` when `create` is set and
    /// the branch does not exist locally.
    pub async fn checkout(&self, branch: &str, create: bool) -> Result<()> {
        if create && !self.has_local_branch(branch).await? {
            self.git("checkout", &["checkout", "-b", branch]).await?;
        } else {
            self.git("checkout", &["checkout", branch]).await?;
        }
        log::debug!("Checked out {} in {}", branch, self.repo_path.display());
        Ok(())
    }

    pub async fn delete_branch(&self, branch: &str) -> Result<()> {
        self.git("branch delete", &["branch", "-D", branch]).await?;
        Ok(())
    }

    pub async fn has_local_branch(&self, branch: &str) -> Result<bool> {
        let reference = format!("refs/heads/{}", branch);
        let output = self
            .run(
                &self.repo_path,
                "rev-parse",
                &["rev-parse", "--verify", "--quiet", &reference],
                false,
            )
            .await?;
        Ok(output.status.success())
    }

    /// Lists the full names of all local branch references.
    pub async fn local_branch_refs(&self) -> Result<Vec<String>> {
        let output = self
            .git(
                "for-each-ref",
                &["for-each-ref", "--format=%(refname)", "refs/heads/"],
            )
            .await?;
        Ok(parse_ref_list(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Fast-forwards the current branch to `refspec` of `remote`.
    pub async fn pull(&self, remote: &str, refspec: &str) -> Result<()> {
        self.remote_git("pull", &["pull", "--ff-only", "--no-rebase", remote, refspec])
            .await?;
        Ok(())
    }

    /// Fetches `refspec` of `remote` into `FETCH_HEAD`.
    pub async fn fetch(&self, remote: &str, refspec: &str) -> Result<()> {
        self.remote_git("fetch", &["fetch", remote, refspec]).await?;
        Ok(())
    }

    pub async fn reset_hard(&self, revision: &str) -> Result<()> {
        self.git("reset", &["reset", "--hard", revision]).await?;
        Ok(())
    }

    pub async fn push(&self, remote: &str, args: &[&str]) -> Result<()> {
        let mut full = vec!["push", remote];
        full.extend_from_slice(args);
        self.remote_git("push", &full).await?;
        log::debug!("Pushed {:?} to {}", args, remote);
        Ok(())
    }

    /// Stages `path` (relative to the working copy), including deletions.
    pub async fn add(&self, path: &str) -> Result<()> {
        self.git("add", &["add", "--all", "--", path]).await?;
        Ok(())
    }

    /// Records a commit as `author`. Extra arguments such as `--amend` are
    /// passed through to `git commit`.
    pub async fn commit(
        &self,
        author: &GitUser,
        message: &str,
        extra: &[&str],
    ) -> Result<CommitOutcome> {
        self.git("config", &["config", "user.name", &author.name])
            .await?;
        self.git("config", &["config", "user.email", &author.email])
            .await?;

        let mut args = vec!["-c", "commit.gpgsign=false", "commit", "-m", message];
        args.extend_from_slice(extra);
        let output = self.run(&self.repo_path, "commit", &args, false).await?;

        if output.status.success() {
            return Ok(CommitOutcome::Committed);
        }

        let text = format_git_error(&output);
        if is_nothing_to_commit(&text) {
            log::debug!("Nothing to commit in {}", self.repo_path.display());
            return Ok(CommitOutcome::NothingToCommit);
        }
        Err(classify_git_error("commit", &text))
    }

    /// Reads a file of the working copy, `None` when it does not exist.
    pub fn read_file(&self, relative: &str) -> Result<Option<String>> {
        let path = self.resolve(relative)?;
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(GitError::ReadFile { path, source }),
        }
    }

    /// Writes a file of the working copy, creating parent directories.
    pub fn write_file(&self, relative: &str, content: &str) -> Result<()> {
        let path = self.resolve(relative)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| GitError::WriteFile {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(&path, content).map_err(|source| GitError::WriteFile { path, source })
    }

    /// Copies the working tree, without git metadata, into `dest`.
    pub fn export_tree(&self, dest: &Path) -> Result<()> {
        copy_tree(&self.repo_path, dest)
    }

    /// Copies `src` over the working tree. Files absent from `src` are kept.
    pub fn import_tree(&self, src: &Path) -> Result<()> {
        copy_tree(src, &self.repo_path)
    }

    /// Resolves a repository-relative path, rejecting escapes from the working copy.
    fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let candidate = Path::new(relative);
        let escapes = candidate.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        let touches_git_dir = candidate
            .components()
            .next()
            .is_some_and(|c| c.as_os_str() == GIT_DIR);
        if relative.is_empty() || escapes || touches_git_dir {
            return Err(GitError::PathTraversal(relative.to_string()));
        }
        Ok(self.repo_path.join(candidate))
    }

    async fn git(&self, operation: &str, args: &[&str]) -> Result<Output> {
        self.execute(&self.repo_path, operation, args, false).await
    }

    async fn remote_git(&self, operation: &str, args: &[&str]) -> Result<Output> {
        self.execute(&self.repo_path, operation, args, true).await
    }

    /// Runs git and maps a non-zero exit status to a classified error.
    async fn execute(
        &self,
        dir: &Path,
        operation: &str,
        args: &[&str],
        remote: bool,
    ) -> Result<Output> {
        let output = self.run(dir, operation, args, remote).await?;
        if output.status.success() {
            Ok(output)
        } else {
            let error = classify_git_error(operation, &format_git_error(&output));
            log::debug!("git {} failed: {}", operation, error);
            Err(error)
        }
    }

    async fn run(&self, dir: &Path, operation: &str, args: &[&str], remote: bool) -> Result<Output> {
        let mut cmd = Command::new("git");
        cmd.current_dir(dir)
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if remote {
            for (key, value) in self.key.ssh_env(&self.user) {
                cmd.env(key, value);
            }
        }

        cmd.output().await.map_err(|source| GitError::Spawn {
            operation: operation.to_string(),
            source,
        })
    }
}

/// Recursively copies `src` into `dest`, skipping a top-level `.git` directory.
fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    let walker = WalkDir::new(src)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| !(entry.depth() == 1 && entry.file_name() == GIT_DIR));

    for entry in walker {
        let entry = entry.map_err(|e| GitError::ReadFile {
            path: e.path().map(Path::to_path_buf).unwrap_or_else(|| src.to_path_buf()),
            source: e.into(),
        })?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|_| GitError::PathTraversal(entry.path().display().to_string()))?;
        let target = dest.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            std::fs::create_dir_all(&target).map_err(|source| GitError::WriteFile {
                path: target.clone(),
                source,
            })?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|source| GitError::WriteFile {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
            std::fs::copy(entry.path(), &target).map_err(|source| GitError::WriteFile {
                path: target.clone(),
                source,
            })?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, target: &Path) -> Result<()> {
    let link = std::fs::read_link(src).map_err(|source| GitError::ReadFile {
        path: src.to_path_buf(),
        source,
    })?;
    if target.symlink_metadata().is_ok() {
        std::fs::remove_file(target).map_err(|source| GitError::WriteFile {
            path: target.to_path_buf(),
            source,
        })?;
    }
    std::os::unix::fs::symlink(&link, target).map_err(|source| GitError::WriteFile {
        path: target.to_path_buf(),
        source,
    })
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, target: &Path) -> Result<()> {
    std::fs::copy(src, target)
        .map(|_| ())
        .map_err(|source| GitError::WriteFile {
            path: target.to_path_buf(),
            source,
        })
}
