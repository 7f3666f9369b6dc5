use super::policy::{can_clone, can_push};
use crate::error::TransportError;
use crate::git::GitService;
use crate::types::{Identity, Repository};

/// Applies the access policy to a transport operation on a known repository.
///
/// Pushes without an identity fail with `Authentication` so HTTP callers can
/// answer with a challenge; every other denial is `Authorization`.
pub fn authorize(
    repo: &Repository,
    service: GitService,
    identity: Option<&Identity>,
) -> Result<(), TransportError> {
    let requester = identity.map(|i| i.user_id.as_str());

    let allowed = match service {
        GitService::UploadPack => can_clone(&repo.owner_id, repo.is_public, requester),
        GitService::ReceivePack => {
            if identity.is_none() {
                return Err(TransportError::Authentication);
            }
            can_push(&repo.owner_id, requester)
        }
    };

    if allowed {
        Ok(())
    } else {
        Err(TransportError::Authorization)
    }
}

/// Access decision for a repository that exists on disk but has no store
/// record. Reads are open; a push needs an identity whose username matches
/// the owner directory.
pub fn authorize_unregistered(
    owner: &str,
    service: GitService,
    identity: Option<&Identity>,
) -> Result<(), TransportError> {
    if !service.is_write() {
        return Ok(());
    }

    match identity {
        None => Err(TransportError::Authentication),
        Some(identity) if identity.username == owner => Ok(()),
        Some(_) => Err(TransportError::Authorization),
    }
}
