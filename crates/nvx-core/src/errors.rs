use std::path::PathBuf;

/// Core error type.
///
/// The first group mirrors the failures a credential command can produce; the
/// command surface maps them onto typed replies. The rest are ambient.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("credential not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("malformed input: {0}")]
    Malformed(String),

    #[error("credential is inactive: {0}")]
    Inactive(String),

    #[error("persistence failure: {path}: {reason}")]
    Persistence { path: PathBuf, reason: String },

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    pub(crate) fn persistence(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Persistence {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
