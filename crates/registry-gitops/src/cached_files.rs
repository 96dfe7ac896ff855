//! Pending edits staged for a registry before its review change exists.
//!
//! Edits are parked as temporary files keyed by registry name. Once the
//! merge request controller holds a working copy on the change, the overlay
//! writes them into the repository and stages them. Entries expire after a
//! configurable time-to-live and their temporary files are removed with them.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use moka::notification::RemovalCause;
use moka::sync::Cache;
use thiserror::Error;

use crate::git::{GitError, GitWorkspace};

#[derive(Error, Debug)]
pub enum CachedFileError {
    #[error("Failed to read cached file '{path}': {source}")]
    ReadTemp {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write cached file in '{path}': {source}")]
    WriteTemp {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove cached file '{path}': {source}")]
    RemoveTemp {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Git(#[from] GitError),
}

/// A staged edit: the repository path and the temporary file holding its content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedFile {
    pub repo_path: String,
    pub temp_path: PathBuf,
}

/// Time-limited store of staged edits keyed by registry name.
#[derive(Clone)]
pub struct CachedFileStore {
    cache: Cache<String, Arc<Vec<CachedFile>>>,
}

impl std::fmt::Debug for CachedFileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedFileStore")
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}

impl CachedFileStore {
    pub fn new(ttl: Duration) -> Self {
        let cache = Cache::builder()
            .time_to_live(ttl)
            .eviction_listener(
                |registry: Arc<String>, files: Arc<Vec<CachedFile>>, cause: RemovalCause| {
                    // Explicit removals clean up after themselves.
                    if cause == RemovalCause::Explicit {
                        return;
                    }
                    log::debug!(
                        "Dropping {} cached files for {} ({:?})",
                        files.len(),
                        registry,
                        cause
                    );
                    for file in files.iter() {
                        if let Err(e) = remove_temp(&file.temp_path) {
                            log::warn!("{}", e);
                        }
                    }
                },
            )
            .build();
        Self { cache }
    }

    /// Writes `files` (repository path to content) as temporary files under
    /// `dir` and records them for `registry`, replacing any earlier entry.
    pub fn stage(
        &self,
        registry: &str,
        dir: &Path,
        files: &BTreeMap<String, String>,
    ) -> Result<Vec<CachedFile>, CachedFileError> {
        let write_error = |source| CachedFileError::WriteTemp {
            path: dir.to_path_buf(),
            source,
        };
        std::fs::create_dir_all(dir).map_err(write_error)?;

        let mut staged = Vec::with_capacity(files.len());
        for (repo_path, content) in files {
            let mut temp = tempfile::Builder::new()
                .prefix("cached-")
                .tempfile_in(dir)
                .map_err(write_error)?;
            temp.write_all(content.as_bytes()).map_err(write_error)?;
            let (_, temp_path) = temp.keep().map_err(|e| write_error(e.error))?;
            staged.push(CachedFile {
                repo_path: repo_path.clone(),
                temp_path,
            });
        }

        self.insert(registry, staged.clone());
        Ok(staged)
    }

    /// Records already written temporary files for `registry`.
    pub fn insert(&self, registry: &str, files: Vec<CachedFile>) {
        self.cache.insert(registry.to_string(), Arc::new(files));
    }

    /// Staged edits for `registry`; empty when there are none or they expired.
    pub fn entries(&self, registry: &str) -> Vec<CachedFile> {
        self.cache
            .get(registry)
            .map(|files| files.as_ref().clone())
            .unwrap_or_default()
    }

    pub fn has_entries(&self, registry: &str) -> bool {
        self.cache
            .get(registry)
            .is_some_and(|files| !files.is_empty())
    }

    /// Forgets the entry of `registry` and deletes its temporary files.
    pub fn clear(&self, registry: &str) -> Result<(), CachedFileError> {
        if let Some(files) = self.cache.remove(registry) {
            for file in files.iter() {
                remove_temp(&file.temp_path)?;
            }
        }
        Ok(())
    }
}

fn remove_temp(path: &Path) -> Result<(), CachedFileError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(CachedFileError::RemoveTemp {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Writes the staged edits of `registry` into `workspace` and stages them.
///
/// Files whose content already matches are skipped. Returns whether any
/// file was written; `false` means the working copy is unchanged.
pub async fn apply_cached_files(
    store: &CachedFileStore,
    registry: &str,
    workspace: &GitWorkspace,
) -> Result<bool, CachedFileError> {
    let mut updated = 0usize;

    for file in store.entries(registry) {
        let content = tokio::fs::read_to_string(&file.temp_path)
            .await
            .map_err(|source| CachedFileError::ReadTemp {
                path: file.temp_path.clone(),
                source,
            })?;

        let current = workspace.read_file(&file.repo_path)?;
        if current.as_deref() == Some(content.as_str()) {
            continue;
        }

        workspace.write_file(&file.repo_path, &content)?;
        workspace.add(&file.repo_path).await?;
        updated += 1;
    }

    log::debug!("Applied {} cached files for {}", updated, registry);
    Ok(updated > 0)
}
