use serde_json::{Value, json};
use thiserror::Error;

/// Request-level failures. The HTTP layer turns each variant into a status
/// code and a small JSON payload in one place.
#[derive(Debug, Error)]
pub enum ServeError {
    /// Guard rejection: bad token, non-loopback peer, or `--serve` mode.
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// Path outside the allowlist or an extension that may not be mutated.
    #[error("illegal request for {0}")]
    Illegal(String),
    #[error("{path} not found")]
    NotFound { path: String, silent: bool },
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ServeError {
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound {
            path: path.into(),
            silent: false,
        }
    }

    pub fn silent_not_found(path: impl Into<String>) -> Self {
        Self::NotFound {
            path: path.into(),
            silent: true,
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            Self::Forbidden(_) | Self::Illegal(_) => 403,
            Self::NotFound { .. } => 404,
            Self::AlreadyExists(_) => 406,
            Self::BadRequest(_) => 400,
            Self::Internal(_) => 500,
        }
    }

    /// Expected-missing files are answered without touching the terminal.
    pub fn should_log(&self) -> bool {
        !matches!(self, Self::NotFound { silent: true, .. })
    }

    pub fn payload(&self) -> Value {
        match self {
            Self::Forbidden(_) => json!("Bad token"),
            Self::Illegal(_) => json!("Illegal"),
            Self::NotFound { path, .. } => json!({ "error": format!("{path} not found") }),
            Self::AlreadyExists(dst) => json!({ "message": format!("{dst} already exists") }),
            Self::BadRequest(reason) => json!({ "error": reason }),
            Self::Internal(err) => json!({ "error": format!("{err:#}") }),
        }
    }
}

pub type ServeResult<T> = std::result::Result<T, ServeError>;
