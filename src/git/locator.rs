use std::path::PathBuf;

use crate::error::TransportError;

const MAX_NAME_LENGTH: usize = 100;

/// Maps `(owner username, repository name)` onto the bare repository layout
/// `{base}/{owner}/{repo}.git`.
#[derive(Debug, Clone)]
pub struct RepoLocator {
    base: PathBuf,
}

impl RepoLocator {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Canonical path for a repository. `proj` and `proj.git` resolve to the
    /// same location. Performs no I/O.
    #[must_use]
    pub fn resolve(&self, owner: &str, repo: &str) -> PathBuf {
        self.base.join(owner).join(repo_dir_name(repo))
    }

    /// Resolves and stats the repository. A missing directory is `None`.
    pub fn locate(&self, owner: &str, repo: &str) -> Option<PathBuf> {
        let path = self.resolve(owner, repo);
        path.is_dir().then_some(path)
    }
}

pub fn strip_git_suffix(name: &str) -> &str {
    name.strip_suffix(".git").unwrap_or(name)
}

/// On-disk directory name for a repository: always ends in `.git`.
#[must_use]
pub fn repo_dir_name(repo: &str) -> String {
    format!("{}.git", strip_git_suffix(repo))
}

/// Validates an owner or repository path segment. Rejects anything that
/// could escape the base directory.
pub fn validate_name(name: &str) -> Result<(), TransportError> {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return Err(TransportError::Protocol(
            "invalid repository path".to_string(),
        ));
    }

    if name == "." || name == ".." {
        return Err(TransportError::Protocol(
            "invalid repository path".to_string(),
        ));
    }

    let valid = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');

    if !valid {
        return Err(TransportError::Protocol(
            "invalid repository path".to_string(),
        ));
    }

    Ok(())
}
