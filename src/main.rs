use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use gatehouse::auth::TokenGenerator;
use gatehouse::config::ServerConfig;
use gatehouse::git::{RepoLocator, init_bare_repo, strip_git_suffix, validate_name};
use gatehouse::server::{AppState, create_router};
use gatehouse::ssh::{SshServer, load_or_generate_host_key, parse_authorized_key};
use gatehouse::store::{SqliteStore, Store};
use gatehouse::types::{AccessToken, Repository, SshKey, User};

#[derive(Parser)]
#[command(name = "gatehouse")]
#[command(about = "Git transport gateway: SSH daemon and smart-HTTP server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Administrative commands
    Admin {
        /// Path to the metadata database
        #[arg(long, env = "DB_PATH", default_value = "./gatehouse.db", global = true)]
        db_path: PathBuf,

        #[command(subcommand)]
        command: AdminCommands,
    },

    /// Start the HTTP gateway and the SSH daemon
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Port for the smart-HTTP gateway
        #[arg(long, env = "HTTP_PORT", default_value = "8080")]
        http_port: u16,

        /// Port for the SSH daemon
        #[arg(long, env = "SSH_PORT", default_value = "2222")]
        ssh_port: u16,

        /// Base directory holding {owner}/{repo}.git
        #[arg(long, env = "REPOSITORIES_PATH", default_value = "./repositories")]
        repositories_path: PathBuf,

        /// Path to the metadata database
        #[arg(long, env = "DB_PATH", default_value = "./gatehouse.db")]
        db_path: PathBuf,

        /// SSH host key, generated if missing
        #[arg(long, env = "SSH_HOST_KEY_PATH", default_value = "./ssh_host_key")]
        ssh_host_key_path: PathBuf,
    },
}

#[derive(Subcommand)]
enum AdminCommands {
    /// Create the metadata database
    Init,

    /// Manage users
    User {
        #[command(subcommand)]
        command: UserCommands,
    },

    /// Manage SSH keys
    Key {
        #[command(subcommand)]
        command: KeyCommands,
    },

    /// Manage repositories
    Repo {
        #[command(subcommand)]
        command: RepoCommands,
    },

    /// Manage HTTP access tokens
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },
}

#[derive(Subcommand)]
enum UserCommands {
    /// Register a user
    Add { username: String },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Register an SSH public key for a user
    Add {
        username: String,
        /// Label for the key
        name: String,
        /// Public key line, e.g. "ssh-ed25519 AAAA... user@host"
        public_key: String,
    },
}

#[derive(Subcommand)]
enum RepoCommands {
    /// Register a repository and create it on disk
    Create {
        owner: String,
        name: String,

        /// Allow anonymous clone
        #[arg(long)]
        public: bool,

        /// Base directory holding {owner}/{repo}.git
        #[arg(long, env = "REPOSITORIES_PATH", default_value = "./repositories")]
        repositories_path: PathBuf,
    },
}

#[derive(Subcommand)]
enum TokenCommands {
    /// Issue an access token for a user
    Create {
        username: String,

        /// Lifetime in days; tokens do not expire by default
        #[arg(long)]
        expires_in_days: Option<i64>,
    },
}

fn open_store(db_path: &Path) -> anyhow::Result<SqliteStore> {
    if !db_path.exists() {
        bail!(
            "Database {} not found. Run 'gatehouse admin init' first.",
            db_path.display()
        );
    }
    let store = SqliteStore::new(db_path)?;
    store.initialize()?;
    Ok(store)
}

fn require_user(store: &SqliteStore, username: &str) -> anyhow::Result<User> {
    store
        .get_user_by_username(username)?
        .with_context(|| format!("user '{username}' not found"))
}

fn run_init(db_path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let store = SqliteStore::new(db_path)?;
    store.initialize()?;

    println!("Initialized database at {}", db_path.display());
    Ok(())
}

fn run_user_add(store: &SqliteStore, username: String) -> anyhow::Result<()> {
    validate_name(&username).context("invalid username")?;

    let user = User {
        id: Uuid::new_v4().to_string(),
        username,
        created_at: Utc::now(),
    };
    store
        .create_user(&user)
        .with_context(|| format!("failed to create user '{}'", user.username))?;

    println!("{}", serde_json::to_string_pretty(&user)?);
    Ok(())
}

fn run_key_add(
    store: &SqliteStore,
    username: &str,
    name: String,
    public_key: &str,
) -> anyhow::Result<()> {
    let user = require_user(store, username)?;
    let (public_key, fingerprint) = parse_authorized_key(public_key)?;

    let key = SshKey {
        id: Uuid::new_v4().to_string(),
        user_id: user.id,
        name,
        public_key,
        fingerprint,
        created_at: Utc::now(),
    };
    store
        .create_ssh_key(&key)
        .context("failed to register key (is it already registered?)")?;

    println!("{}", key.fingerprint);
    Ok(())
}

async fn run_repo_create(
    store: &SqliteStore,
    owner: &str,
    name: &str,
    public: bool,
    repositories_path: PathBuf,
) -> anyhow::Result<()> {
    let user = require_user(store, owner)?;
    let name = strip_git_suffix(name);
    validate_name(name).context("invalid repository name")?;

    let locator = RepoLocator::new(repositories_path);
    let path = locator.resolve(&user.username, name);
    if path.exists() {
        bail!("{} already exists", path.display());
    }

    let repo = Repository {
        id: Uuid::new_v4().to_string(),
        owner_id: user.id,
        owner_username: user.username,
        name: name.to_string(),
        is_public: public,
        created_at: Utc::now(),
    };
    // The directory must exist before the row does, so a failure on either
    // side leaves nothing behind.
    if let Err(e) = init_bare_repo(&path).await {
        remove_partial_repo(&path).await;
        return Err(e).with_context(|| format!("failed to initialize {}", path.display()));
    }
    if let Err(e) = store.create_repository(&repo) {
        remove_partial_repo(&path).await;
        return Err(e)
            .with_context(|| format!("failed to register repository '{owner}/{name}'"));
    }

    println!("{}", serde_json::to_string_pretty(&repo)?);
    Ok(())
}

async fn remove_partial_repo(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove partial repository"),
    }
}

fn run_token_create(
    store: &SqliteStore,
    username: &str,
    expires_in_days: Option<i64>,
) -> anyhow::Result<()> {
    let user = require_user(store, username)?;
    let (raw_token, lookup, hash) = TokenGenerator::new().generate()?;

    let now = Utc::now();
    let token = AccessToken {
        id: Uuid::new_v4().to_string(),
        user_id: user.id,
        token_hash: hash,
        token_lookup: lookup,
        created_at: now,
        expires_at: expires_in_days.map(|days| now + chrono::Duration::days(days)),
        last_used_at: None,
    };
    store.create_token(&token)?;

    println!("{raw_token}");
    Ok(())
}

async fn run_admin(db_path: PathBuf, command: AdminCommands) -> anyhow::Result<()> {
    match command {
        AdminCommands::Init => run_init(&db_path),
        AdminCommands::User {
            command: UserCommands::Add { username },
        } => run_user_add(&open_store(&db_path)?, username),
        AdminCommands::Key {
            command:
                KeyCommands::Add {
                    username,
                    name,
                    public_key,
                },
        } => run_key_add(&open_store(&db_path)?, &username, name, &public_key),
        AdminCommands::Repo {
            command:
                RepoCommands::Create {
                    owner,
                    name,
                    public,
                    repositories_path,
                },
        } => {
            let store = open_store(&db_path)?;
            run_repo_create(&store, &owner, &name, public, repositories_path).await
        }
        AdminCommands::Token {
            command:
                TokenCommands::Create {
                    username,
                    expires_in_days,
                },
        } => run_token_create(&open_store(&db_path)?, &username, expires_in_days),
    }
}

async fn run_serve(config: ServerConfig) -> anyhow::Result<()> {
    let store = open_store(&config.db_path)?;
    std::fs::create_dir_all(&config.repositories_path)?;
    let host_key = load_or_generate_host_key(&config.ssh_host_key_path)?;

    let state = Arc::new(AppState {
        store: Arc::new(store),
        repositories: RepoLocator::new(config.repositories_path.clone()),
    });

    let http_addr = config.http_addr()?;
    let ssh_addr = config.ssh_addr()?;

    let app = create_router(Arc::clone(&state));
    let http_listener = tokio::net::TcpListener::bind(http_addr).await?;
    let ssh_listener = tokio::net::TcpListener::bind(ssh_addr).await?;

    info!(
        "Serving {} over HTTP on {} and SSH on {}",
        config.repositories_path.display(),
        http_addr,
        ssh_addr
    );

    let http = async {
        axum::serve(
            http_listener,
            app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .await
        .context("HTTP server failed")
    };
    let ssh = async {
        SshServer::new(state, host_key)
            .run(ssh_listener)
            .await
            .context("SSH server failed")
    };

    tokio::try_join!(http, ssh)?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("gatehouse=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Admin { db_path, command } => run_admin(db_path, command).await?,
        Commands::Serve {
            host,
            http_port,
            ssh_port,
            repositories_path,
            db_path,
            ssh_host_key_path,
        } => {
            run_serve(ServerConfig {
                host,
                http_port,
                ssh_port,
                repositories_path,
                db_path,
                ssh_host_key_path,
            })
            .await?;
        }
    }

    Ok(())
}
