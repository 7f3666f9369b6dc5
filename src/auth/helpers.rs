use chrono::Utc;

use super::{TokenGenerator, parse_token};
use crate::store::Store;
use crate::types::Identity;

#[derive(Debug, PartialEq, Eq)]
pub enum CredentialError {
    InvalidScheme,
    InvalidToken,
    TokenExpired,
    InternalError,
}

/// Extracts the password half of a Basic auth header.
/// Git credential helpers send `Basic base64(<username>:<token>)`; the
/// username is ignored and the token alone identifies the user.
fn extract_basic_auth_token(encoded: &str) -> Option<String> {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;

    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let credentials = String::from_utf8(decoded).ok()?;
    let (_, password) = credentials.split_once(':')?;

    if password.is_empty() {
        return None;
    }

    Some(password.to_string())
}

/// Extracts a token from an Authorization header (Bearer or Basic).
/// Returns `Ok(None)` when no header is present.
pub fn extract_token_from_header(
    auth_header: Option<&str>,
) -> Result<Option<String>, CredentialError> {
    let Some(header) = auth_header else {
        return Ok(None);
    };

    if let Some(token) = header.strip_prefix("Bearer ") {
        let token = token.trim();
        if token.is_empty() {
            return Err(CredentialError::InvalidToken);
        }
        return Ok(Some(token.to_string()));
    }

    if let Some(encoded) = header.strip_prefix("Basic ") {
        return extract_basic_auth_token(encoded)
            .ok_or(CredentialError::InvalidToken)
            .map(Some);
    }

    Err(CredentialError::InvalidScheme)
}

/// Resolves the identity behind an Authorization header, querying the store
/// fresh on every call. `Ok(None)` means the request is anonymous.
pub fn resolve_bearer_identity(
    store: &dyn Store,
    auth_header: Option<&str>,
) -> Result<Option<Identity>, CredentialError> {
    let Some(raw_token) = extract_token_from_header(auth_header)? else {
        return Ok(None);
    };

    let (lookup, _secret) =
        parse_token(&raw_token).map_err(|_| CredentialError::InvalidToken)?;

    let token = store
        .get_token_by_lookup(&lookup)
        .map_err(|_| CredentialError::InternalError)?
        .ok_or(CredentialError::InvalidToken)?;

    let generator = TokenGenerator::new();
    if !generator
        .verify(&raw_token, &token.token_hash)
        .map_err(|_| CredentialError::InternalError)?
    {
        return Err(CredentialError::InvalidToken);
    }

    if token.expires_at.is_some_and(|expires_at| expires_at < Utc::now()) {
        return Err(CredentialError::TokenExpired);
    }

    let user = store
        .get_user(&token.user_id)
        .map_err(|_| CredentialError::InternalError)?
        .ok_or(CredentialError::InvalidToken)?;

    if let Err(e) = store.update_token_last_used(&token.id) {
        tracing::warn!("Failed to update token last_used_at: {e}");
    }

    Ok(Some(user.identity()))
}

#[cfg(test)]
mod tests {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use chrono::Duration;

    use super::*;
    use crate::store::SqliteStore;
    use crate::types::{AccessToken, User};

    fn store_with_token(expires_at: Option<chrono::DateTime<Utc>>) -> (SqliteStore, String) {
        let store = SqliteStore::in_memory().unwrap();
        store.initialize().unwrap();
        store
            .create_user(&User {
                id: "u1".to_string(),
                username: "alice".to_string(),
                created_at: Utc::now(),
            })
            .unwrap();

        let (raw, lookup, hash) = TokenGenerator::new().generate().unwrap();
        store
            .create_token(&AccessToken {
                id: "t1".to_string(),
                user_id: "u1".to_string(),
                token_hash: hash,
                token_lookup: lookup,
                created_at: Utc::now(),
                expires_at,
                last_used_at: None,
            })
            .unwrap();

        (store, raw)
    }

    #[test]
    fn test_extract_bearer_and_basic() {
        assert_eq!(extract_token_from_header(None), Ok(None));
        assert_eq!(
            extract_token_from_header(Some("Bearer abc")),
            Ok(Some("abc".to_string()))
        );

        let basic = format!("Basic {}", STANDARD.encode("alice:abc"));
        assert_eq!(
            extract_token_from_header(Some(&basic)),
            Ok(Some("abc".to_string()))
        );

        assert_eq!(
            extract_token_from_header(Some("Digest abc")),
            Err(CredentialError::InvalidScheme)
        );
        assert_eq!(
            extract_token_from_header(Some("Basic !!!")),
            Err(CredentialError::InvalidToken)
        );
    }

    #[test]
    fn test_resolve_valid_token() {
        let (store, raw) = store_with_token(None);
        let header = format!("Bearer {raw}");

        let identity = resolve_bearer_identity(&store, Some(&header))
            .unwrap()
            .unwrap();
        assert_eq!(identity.user_id, "u1");
        assert_eq!(identity.username, "alice");
    }

    #[test]
    fn test_resolve_anonymous() {
        let (store, _) = store_with_token(None);
        assert_eq!(resolve_bearer_identity(&store, None), Ok(None));
    }

    #[test]
    fn test_resolve_rejects_wrong_secret() {
        let (store, raw) = store_with_token(None);
        let tampered = format!("{}000000", &raw[..raw.len() - 6]);
        let header = format!("Bearer {tampered}");

        assert_eq!(
            resolve_bearer_identity(&store, Some(&header)),
            Err(CredentialError::InvalidToken)
        );
    }

    #[test]
    fn test_resolve_rejects_expired_token() {
        let (store, raw) = store_with_token(Some(Utc::now() - Duration::hours(1)));
        let header = format!("Bearer {raw}");

        assert_eq!(
            resolve_bearer_identity(&store, Some(&header)),
            Err(CredentialError::TokenExpired)
        );
    }
}
