mod access;
mod helpers;
pub mod policy;
mod token;

pub use access::{authorize, authorize_unregistered};
pub use helpers::{CredentialError, extract_token_from_header, resolve_bearer_identity};
pub use token::{TokenGenerator, parse_token};
