use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("already exists")]
    AlreadyExists,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid token format")]
    InvalidTokenFormat,

    #[error("invalid ssh key: {0}")]
    InvalidKey(String),

    #[error("bad request: {0}")]
    BadRequest(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failures of a single transport request, shared by the SSH daemon and the
/// HTTP gateway. Everything up to `NotFound` is decided before a subprocess
/// exists.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("authentication required")]
    Authentication,

    #[error("{0}")]
    Protocol(String),

    #[error("access denied")]
    Authorization,

    #[error("repository not found")]
    NotFound,

    #[error("failed to start git: {0}")]
    Subprocess(#[source] std::io::Error),

    #[error("relay failed: {0}")]
    Relay(String),

    #[error("internal server error")]
    Internal,
}

impl TransportError {
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::Authentication => StatusCode::UNAUTHORIZED,
            Self::Protocol(_) => StatusCode::BAD_REQUEST,
            Self::Authorization => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Subprocess(_) | Self::Relay(_) | Self::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Text shown to the remote client. Subprocess details stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            Self::Subprocess(_) | Self::Relay(_) | Self::Internal => {
                "internal server error".to_string()
            }
            other => other.to_string(),
        }
    }

    pub fn requires_auth_header(&self) -> bool {
        matches!(self, Self::Authentication)
    }
}
