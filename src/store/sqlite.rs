use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::Store;
use super::schema::SCHEMA;
use crate::error::{Error, Result};
use crate::types::*;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        Self::configure(conn)
    }

    /// Opens a private in-memory database. Useful for tests and dry runs.
    pub fn in_memory() -> Result<Self> {
        Self::configure(Connection::open_in_memory()?)
    }

    fn configure(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // Handle SQLite's default datetime format: "YYYY-MM-DD HH:MM:SS"
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            tracing::error!("Invalid datetime in database: '{}' - {}", s, e);
            Utc::now()
        })
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_datetime)
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn map_constraint(result: rusqlite::Result<usize>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(Error::AlreadyExists)
        }
        Err(e) => Err(Error::from(e)),
    }
}

fn row_to_user(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        created_at: parse_datetime(&row.get::<_, String>(2)?),
    })
}

fn row_to_repository(row: &Row<'_>) -> rusqlite::Result<Repository> {
    Ok(Repository {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        owner_username: row.get(2)?,
        name: row.get(3)?,
        is_public: row.get(4)?,
        created_at: parse_datetime(&row.get::<_, String>(5)?),
    })
}

fn row_to_ssh_key(row: &Row<'_>) -> rusqlite::Result<SshKey> {
    Ok(SshKey {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        public_key: row.get(3)?,
        fingerprint: row.get(4)?,
        created_at: parse_datetime(&row.get::<_, String>(5)?),
    })
}

fn row_to_token(row: &Row<'_>) -> rusqlite::Result<AccessToken> {
    Ok(AccessToken {
        id: row.get(0)?,
        user_id: row.get(1)?,
        token_hash: row.get(2)?,
        token_lookup: row.get(3)?,
        created_at: parse_datetime(&row.get::<_, String>(4)?),
        expires_at: parse_optional_datetime(row.get(5)?),
        last_used_at: parse_optional_datetime(row.get(6)?),
    })
}

impl Store for SqliteStore {
    fn initialize(&self) -> Result<()> {
        self.conn().execute_batch(SCHEMA)?;
        Ok(())
    }

    // User operations

    fn create_user(&self, user: &User) -> Result<()> {
        map_constraint(self.conn().execute(
            "INSERT INTO users (id, username, created_at) VALUES (?1, ?2, ?3)",
            params![user.id, user.username, format_datetime(&user.created_at)],
        ))
    }

    fn get_user(&self, id: &str) -> Result<Option<User>> {
        self.conn()
            .query_row(
                "SELECT id, username, created_at FROM users WHERE id = ?1",
                params![id],
                row_to_user,
            )
            .optional()
            .map_err(Error::from)
    }

    fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        self.conn()
            .query_row(
                "SELECT id, username, created_at FROM users WHERE username = ?1",
                params![username],
                row_to_user,
            )
            .optional()
            .map_err(Error::from)
    }

    // Repository operations

    fn create_repository(&self, repo: &Repository) -> Result<()> {
        map_constraint(self.conn().execute(
            "INSERT INTO repositories (id, owner_id, name, is_public, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                repo.id,
                repo.owner_id,
                repo.name,
                repo.is_public,
                format_datetime(&repo.created_at),
            ],
        ))
    }

    fn get_repository(&self, owner_username: &str, name: &str) -> Result<Option<Repository>> {
        self.conn()
            .query_row(
                "SELECT r.id, r.owner_id, u.username, r.name, r.is_public, r.created_at
                 FROM repositories r
                 JOIN users u ON r.owner_id = u.id
                 WHERE u.username = ?1 AND r.name = ?2",
                params![owner_username, name],
                row_to_repository,
            )
            .optional()
            .map_err(Error::from)
    }

    // SSH key operations

    fn create_ssh_key(&self, key: &SshKey) -> Result<()> {
        map_constraint(self.conn().execute(
            "INSERT INTO ssh_keys (id, user_id, name, public_key, fingerprint, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                key.id,
                key.user_id,
                key.name,
                key.public_key,
                key.fingerprint,
                format_datetime(&key.created_at),
            ],
        ))
    }

    fn list_ssh_keys(&self, user_id: &str) -> Result<Vec<SshKey>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, name, public_key, fingerprint, created_at
             FROM ssh_keys WHERE user_id = ?1 ORDER BY created_at, id",
        )?;

        let rows = stmt.query_map(params![user_id], row_to_ssh_key)?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn get_identity_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Identity>> {
        self.conn()
            .query_row(
                "SELECT u.id, u.username
                 FROM ssh_keys k
                 JOIN users u ON k.user_id = u.id
                 WHERE k.fingerprint = ?1
                 ORDER BY k.created_at, k.id
                 LIMIT 1",
                params![fingerprint],
                |row| {
                    Ok(Identity {
                        user_id: row.get(0)?,
                        username: row.get(1)?,
                    })
                },
            )
            .optional()
            .map_err(Error::from)
    }

    // Access token operations

    fn create_token(&self, token: &AccessToken) -> Result<()> {
        map_constraint(self.conn().execute(
            "INSERT INTO access_tokens (id, user_id, token_hash, token_lookup, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                token.id,
                token.user_id,
                token.token_hash,
                token.token_lookup,
                format_datetime(&token.created_at),
                token.expires_at.as_ref().map(format_datetime),
            ],
        ))
    }

    fn get_token_by_lookup(&self, lookup: &str) -> Result<Option<AccessToken>> {
        self.conn()
            .query_row(
                "SELECT id, user_id, token_hash, token_lookup, created_at, expires_at, last_used_at
                 FROM access_tokens WHERE token_lookup = ?1",
                params![lookup],
                row_to_token,
            )
            .optional()
            .map_err(Error::from)
    }

    fn update_token_last_used(&self, id: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE access_tokens SET last_used_at = ?1 WHERE id = ?2",
            params![format_datetime(&Utc::now()), id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn user(id: &str, username: &str) -> User {
        User {
            id: id.to_string(),
            username: username.to_string(),
            created_at: Utc::now(),
        }
    }

    fn key(id: &str, user_id: &str, fingerprint: &str) -> SshKey {
        SshKey {
            id: id.to_string(),
            user_id: user_id.to_string(),
            name: "laptop".to_string(),
            public_key: "ssh-ed25519 AAAA".to_string(),
            fingerprint: fingerprint.to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_initialize_creates_tables() {
        let temp = TempDir::new().unwrap();
        let store = SqliteStore::new(temp.path().join("test.db")).unwrap();
        store.initialize().unwrap();

        let conn = store.conn();
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        assert!(tables.contains(&"users".to_string()));
        assert!(tables.contains(&"repositories".to_string()));
        assert!(tables.contains(&"ssh_keys".to_string()));
        assert!(tables.contains(&"access_tokens".to_string()));
    }

    #[test]
    fn test_repository_lookup_by_owner_username() {
        let store = SqliteStore::in_memory().unwrap();
        store.initialize().unwrap();
        store.create_user(&user("u1", "alice")).unwrap();

        let repo = Repository {
            id: "r1".to_string(),
            owner_id: "u1".to_string(),
            owner_username: "alice".to_string(),
            name: "proj".to_string(),
            is_public: true,
            created_at: Utc::now(),
        };
        store.create_repository(&repo).unwrap();

        let fetched = store.get_repository("alice", "proj").unwrap().unwrap();
        assert_eq!(fetched.id, "r1");
        assert_eq!(fetched.owner_id, "u1");
        assert_eq!(fetched.owner_username, "alice");
        assert!(fetched.is_public);

        assert!(store.get_repository("bob", "proj").unwrap().is_none());
        assert!(store.get_repository("alice", "other").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_repository_is_rejected() {
        let store = SqliteStore::in_memory().unwrap();
        store.initialize().unwrap();
        store.create_user(&user("u1", "alice")).unwrap();

        let repo = Repository {
            id: "r1".to_string(),
            owner_id: "u1".to_string(),
            owner_username: "alice".to_string(),
            name: "proj".to_string(),
            is_public: false,
            created_at: Utc::now(),
        };
        store.create_repository(&repo).unwrap();

        let again = Repository {
            id: "r2".to_string(),
            ..repo
        };
        assert!(matches!(
            store.create_repository(&again),
            Err(Error::AlreadyExists)
        ));
    }

    #[test]
    fn test_identity_by_fingerprint() {
        let store = SqliteStore::in_memory().unwrap();
        store.initialize().unwrap();
        store.create_user(&user("u1", "alice")).unwrap();
        store.create_user(&user("u2", "bob")).unwrap();
        store.create_ssh_key(&key("k1", "u1", "SHA256:alice")).unwrap();
        store.create_ssh_key(&key("k2", "u2", "SHA256:bob")).unwrap();

        let identity = store
            .get_identity_by_fingerprint("SHA256:alice")
            .unwrap()
            .unwrap();
        assert_eq!(identity.user_id, "u1");
        assert_eq!(identity.username, "alice");

        assert!(
            store
                .get_identity_by_fingerprint("SHA256:unknown")
                .unwrap()
                .is_none()
        );
        assert_eq!(store.list_ssh_keys("u2").unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_fingerprint_is_rejected() {
        let store = SqliteStore::in_memory().unwrap();
        store.initialize().unwrap();
        store.create_user(&user("u1", "alice")).unwrap();
        store.create_user(&user("u2", "bob")).unwrap();
        store.create_ssh_key(&key("k1", "u1", "SHA256:same")).unwrap();

        assert!(matches!(
            store.create_ssh_key(&key("k2", "u2", "SHA256:same")),
            Err(Error::AlreadyExists)
        ));
    }

    #[test]
    fn test_token_roundtrip_and_last_used() {
        let store = SqliteStore::in_memory().unwrap();
        store.initialize().unwrap();
        store.create_user(&user("u1", "alice")).unwrap();

        let token = AccessToken {
            id: "t1".to_string(),
            user_id: "u1".to_string(),
            token_hash: "$argon2id$stub".to_string(),
            token_lookup: "abcd1234".to_string(),
            created_at: Utc::now(),
            expires_at: None,
            last_used_at: None,
        };
        store.create_token(&token).unwrap();

        let fetched = store.get_token_by_lookup("abcd1234").unwrap().unwrap();
        assert_eq!(fetched.user_id, "u1");
        assert!(fetched.last_used_at.is_none());

        store.update_token_last_used("t1").unwrap();
        let fetched = store.get_token_by_lookup("abcd1234").unwrap().unwrap();
        assert!(fetched.last_used_at.is_some());
    }
}
