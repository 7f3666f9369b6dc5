use std::path::PathBuf;

use axum::http::{HeaderMap, header};

use crate::auth::{CredentialError, authorize, authorize_unregistered, resolve_bearer_identity};
use crate::error::TransportError;
use crate::git::{GitService, strip_git_suffix, validate_name};
use crate::server::AppState;
use crate::types::Identity;

/// Resolves the optional caller identity from the Authorization header.
/// A header that is present but unusable is an authentication failure.
pub fn extract_git_identity(
    headers: &HeaderMap,
    state: &AppState,
) -> Result<Option<Identity>, TransportError> {
    let auth_header = headers
        .get(header::AUTHORIZATION)
        .map(|h| h.to_str().map_err(|_| TransportError::Authentication))
        .transpose()?;

    resolve_bearer_identity(state.store.as_ref(), auth_header).map_err(|e| match e {
        CredentialError::InvalidScheme
        | CredentialError::InvalidToken
        | CredentialError::TokenExpired => TransportError::Authentication,
        CredentialError::InternalError => TransportError::Internal,
    })
}

/// Resolves `owner/repo` to a repository directory and applies the access
/// policy for `service`.
///
/// The store decides access for registered repositories. A repository the
/// store does not know is looked up on disk before it is declared missing.
pub fn resolve_git_repository(
    state: &AppState,
    owner: &str,
    repo: &str,
    service: GitService,
    identity: Option<&Identity>,
) -> Result<PathBuf, TransportError> {
    let repo = strip_git_suffix(repo);
    validate_name(owner)?;
    validate_name(repo)?;

    let record = state.store.get_repository(owner, repo).map_err(|e| {
        tracing::error!(owner, repo, error = %e, "repository lookup failed");
        TransportError::Internal
    })?;

    match record {
        Some(record) => authorize(&record, service, identity)?,
        None => {
            if state.repositories.locate(owner, repo).is_none() {
                return Err(TransportError::NotFound);
            }
            authorize_unregistered(owner, service, identity)?;
        }
    }

    state
        .repositories
        .locate(owner, repo)
        .ok_or(TransportError::NotFound)
}
