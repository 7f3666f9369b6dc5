//! Git-facing pieces shared by both transports: the on-disk repository
//! layout, the transport services and the SSH exec command grammar.

mod command;
mod locator;
mod process;

pub use command::{GitCommand, RepoSlug, parse_command};
pub use locator::{RepoLocator, repo_dir_name, strip_git_suffix, validate_name};
pub use process::{GitService, POST_RECEIVE_HOOK, init_bare_repo};
