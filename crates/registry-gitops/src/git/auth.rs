//! SSH key handling for git remote operations.

use std::io::Write;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};

use super::error::{GitError, Result};

/// Escapes a token for safe use in single-quoted shell strings.
/// Replaces single quotes with '\'' (end quote, escaped quote, start quote).
pub fn shell_escape_token(token: &str) -> String {
    token.replace('\'', "'\\''")
}

/// Credentials used to reach the review system's git remotes.
#[derive(Clone)]
pub struct GitCredentials {
    pub user: String,
    pub private_key: SecretString,
}

impl GitCredentials {
    pub fn new(user: impl Into<String>, private_key: SecretString) -> Self {
        Self {
            user: user.into(),
            private_key,
        }
    }
}

impl std::fmt::Debug for GitCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitCredentials")
            .field("user", &self.user)
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

/// RAII guard for a private key written to disk.
///
/// The key is written with owner-only read permission and deleted when the
/// guard is dropped, so key material does not outlive the workspace even if
/// an operation fails midway.
#[derive(Debug)]
pub struct SshKeyFile {
    path: Option<PathBuf>,
}

impl SshKeyFile {
    /// Writes `key` to a uniquely named file inside `dir`.
    pub fn write(dir: &Path, key: &SecretString) -> Result<Self> {
        let path = dir.join(format!(".ssh-key-{}", uuid::Uuid::new_v4()));
        let key_error = |source| GitError::KeyFile {
            path: path.clone(),
            source,
        };

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o400);
        }
        let mut file = options.open(&path).map_err(key_error)?;

        // Removes the file again if writing fails below.
        let guard = Self {
            path: Some(path.clone()),
        };

        let material = key.expose_secret();
        file.write_all(material.as_bytes()).map_err(key_error)?;
        if !material.ends_with('\n') {
            file.write_all(b"\n").map_err(key_error)?;
        }
        file.flush().map_err(key_error)?;

        Ok(guard)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Environment variables that make git's ssh transport use this key as `user`.
    pub fn ssh_env(&self, user: &str) -> Vec<(String, String)> {
        let Some(path) = &self.path else {
            return Vec::new();
        };
        let command = format!(
            "ssh -i '{}' -l '{}' -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null -o IdentitiesOnly=yes",
            shell_escape_token(&path.to_string_lossy()),
            shell_escape_token(user),
        );
        vec![
            ("GIT_SSH_COMMAND".to_string(), command),
            ("GIT_SSH_VARIANT".to_string(), "ssh".to_string()),
        ]
    }
}

impl Drop for SshKeyFile {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("Failed to clean up ssh key file: {}", e);
                }
            }
        }
    }
}
