mod schema;
mod sqlite;

pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::types::*;

/// Store defines the metadata interface consumed by the transports.
///
/// The transports only read through `get_repository`,
/// `get_identity_by_fingerprint` and the token lookups; the remaining
/// operations exist for provisioning.
pub trait Store: Send + Sync {
    fn initialize(&self) -> Result<()>;

    // User operations
    fn create_user(&self, user: &User) -> Result<()>;
    fn get_user(&self, id: &str) -> Result<Option<User>>;
    fn get_user_by_username(&self, username: &str) -> Result<Option<User>>;

    // Repository operations
    fn create_repository(&self, repo: &Repository) -> Result<()>;
    fn get_repository(&self, owner_username: &str, name: &str) -> Result<Option<Repository>>;

    // SSH key operations
    fn create_ssh_key(&self, key: &SshKey) -> Result<()>;
    fn list_ssh_keys(&self, user_id: &str) -> Result<Vec<SshKey>>;
    /// Resolves a key fingerprint to its owner. Oldest registration wins if
    /// the same fingerprint was stored more than once.
    fn get_identity_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Identity>>;

    // Access token operations
    fn create_token(&self, token: &AccessToken) -> Result<()>;
    fn get_token_by_lookup(&self, lookup: &str) -> Result<Option<AccessToken>>;
    fn update_token_last_used(&self, id: &str) -> Result<()>;
}
