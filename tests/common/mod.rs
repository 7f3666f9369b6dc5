//! Shared fixture: a store with two users, one public and one private
//! repository owned by alice, a token and an SSH key per user.

#![allow(dead_code)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use chrono::Utc;
use gatehouse::auth::TokenGenerator;
use gatehouse::git::{RepoLocator, init_bare_repo};
use gatehouse::server::AppState;
use gatehouse::ssh::fingerprint_of;
use gatehouse::store::{SqliteStore, Store};
use gatehouse::types::{AccessToken, Repository, SshKey, User};
use russh_keys::PublicKeyBase64;
use russh_keys::key::KeyPair;
use tempfile::TempDir;

pub struct Account {
    pub user: User,
    pub token: String,
    pub key: Arc<KeyPair>,
}

pub struct Fixture {
    pub temp_dir: TempDir,
    pub state: Arc<AppState>,
    pub alice: Account,
    pub bob: Account,
}

fn add_account(store: &SqliteStore, id: &str, username: &str) -> Account {
    let user = User {
        id: id.to_string(),
        username: username.to_string(),
        created_at: Utc::now(),
    };
    store.create_user(&user).expect("create user");

    let (token, lookup, hash) = TokenGenerator::new().generate().expect("generate token");
    store
        .create_token(&AccessToken {
            id: format!("{id}-token"),
            user_id: id.to_string(),
            token_hash: hash,
            token_lookup: lookup,
            created_at: Utc::now(),
            expires_at: None,
            last_used_at: None,
        })
        .expect("create token");

    let key = KeyPair::generate_ed25519();
    let public = key.clone_public_key().expect("public key");
    store
        .create_ssh_key(&SshKey {
            id: format!("{id}-key"),
            user_id: id.to_string(),
            name: "laptop".to_string(),
            public_key: format!("{} {}", public.name(), public.public_key_base64()),
            fingerprint: fingerprint_of(&public),
            created_at: Utc::now(),
        })
        .expect("create ssh key");

    Account {
        user,
        token,
        key: Arc::new(key),
    }
}

impl Fixture {
    pub async fn new() -> Self {
        let temp_dir = TempDir::new().expect("create temp dir");
        let store = SqliteStore::new(temp_dir.path().join("gatehouse.db")).expect("open store");
        store.initialize().expect("initialize store");

        let alice = add_account(&store, "u1", "alice");
        let bob = add_account(&store, "u2", "bob");

        let locator = RepoLocator::new(temp_dir.path().join("repositories"));
        for (id, name, is_public) in [("r1", "pub", true), ("r2", "priv", false)] {
            store
                .create_repository(&Repository {
                    id: id.to_string(),
                    owner_id: alice.user.id.clone(),
                    owner_username: "alice".to_string(),
                    name: name.to_string(),
                    is_public,
                    created_at: Utc::now(),
                })
                .expect("create repository");
            init_bare_repo(&locator.resolve("alice", name))
                .await
                .expect("init bare repository");
        }

        let state = Arc::new(AppState {
            store: Arc::new(store),
            repositories: locator,
        });

        Self {
            temp_dir,
            state,
            alice,
            bob,
        }
    }

    /// Makes a one-commit working repository and returns it with the commit id.
    pub fn commit_worktree(&self, name: &str) -> (PathBuf, String) {
        let dir = self.temp_dir.path().join("work").join(name);
        std::fs::create_dir_all(&dir).expect("create worktree");
        git(&dir, &["init", "--quiet"]);
        std::fs::write(dir.join("README"), "hello\n").expect("write README");
        git(&dir, &["add", "README"]);
        git(&dir, &["commit", "--quiet", "-m", "initial"]);
        let sha = git(&dir, &["rev-parse", "HEAD"]);
        (dir, sha)
    }

    /// Pushes a fresh commit straight into a bare repository on disk as
    /// `refs/heads/main`.
    pub fn seed_commit(&self, owner: &str, repo: &str) -> String {
        let (dir, sha) = self.commit_worktree(&format!("{owner}-{repo}"));
        let bare = self.state.repositories.resolve(owner, repo);
        let bare = bare.to_str().expect("utf-8 temp path");
        git(&dir, &["push", "--quiet", bare, &format!("{sha}:refs/heads/main")]);
        sha
    }

    /// Tip of `refs/heads/main` in a bare repository.
    pub fn main_ref(&self, owner: &str, repo: &str) -> String {
        git(
            &self.state.repositories.resolve(owner, repo),
            &["rev-parse", "refs/heads/main"],
        )
    }

    /// Creates a bare repository on disk without registering it.
    pub async fn unregistered_repo(&self, owner: &str, name: &str) {
        init_bare_repo(&self.state.repositories.resolve(owner, name))
            .await
            .expect("init bare repository");
    }
}

/// Runs git isolated from the user's configuration and returns trimmed stdout.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = isolated_git(dir)
        .args(args)
        .output()
        .expect("run git");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn isolated_git(dir: &Path) -> Command {
    let mut command = Command::new("git");
    command
        .current_dir(dir)
        .env("GIT_CONFIG_NOSYSTEM", "1")
        .env("GIT_CONFIG_GLOBAL", "/dev/null")
        .env("GIT_AUTHOR_NAME", "Test")
        .env("GIT_AUTHOR_EMAIL", "test@example.com")
        .env("GIT_COMMITTER_NAME", "Test")
        .env("GIT_COMMITTER_EMAIL", "test@example.com");
    command
}

/// Packfile holding every object reachable from `sha`.
pub fn pack_objects(dir: &Path, sha: &str) -> Vec<u8> {
    let mut child = isolated_git(dir)
        .args(["pack-objects", "--revs", "--stdout", "--quiet"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .expect("spawn pack-objects");
    child
        .stdin
        .take()
        .expect("pack-objects stdin")
        .write_all(format!("{sha}\n").as_bytes())
        .expect("write revs");
    let output = child.wait_with_output().expect("wait pack-objects");
    assert!(output.status.success(), "pack-objects failed");
    output.stdout
}

/// Frames `payload` as a pkt-line.
pub fn pkt_line(payload: &str) -> String {
    format!("{:04x}{payload}", payload.len() + 4)
}

/// receive-pack request creating `refs/heads/main` at `sha`, followed by
/// the pack.
pub fn push_request(worktree: &Path, sha: &str) -> Vec<u8> {
    let zero = "0".repeat(40);
    let command = format!("{zero} {sha} refs/heads/main\0report-status\n");
    let mut request = pkt_line(&command).into_bytes();
    request.extend_from_slice(b"0000");
    request.extend(pack_objects(worktree, sha));
    request
}
