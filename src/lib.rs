//! # Gatehouse
//!
//! Git transport and authorization layer: an SSH daemon that runs
//! `git upload-pack`/`git receive-pack` for keys it recognizes, and a
//! smart-HTTP gateway in front of `git http-backend`. Both consult the same
//! ownership policy and the same metadata store.
//!
//! ## Library Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use gatehouse::git::RepoLocator;
//! use gatehouse::server::{AppState, create_router};
//! use gatehouse::store::{SqliteStore, Store};
//!
//! let store = SqliteStore::new("./gatehouse.db")?;
//! store.initialize()?;
//!
//! let state = Arc::new(AppState {
//!     store: Arc::new(store),
//!     repositories: RepoLocator::new("./repositories"),
//! });
//! let router = create_router(state);
//! // Serve with axum...
//! ```
//!
//! ## Feature Flags
//!
//! - `cli` (default): builds the `gatehouse` binary.

pub mod auth;
pub mod config;
pub mod error;
pub mod git;
pub mod server;
pub mod ssh;
pub mod store;
pub mod types;
