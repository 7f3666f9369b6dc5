mod git;
mod router;

pub use git::git_router;
pub use router::{AppState, create_router};
