//! Typed error hierarchy for teamspace.
//!
//! Two top-level enums cover the two sides of the system:
//! - `BoardError`: server-side repository and API failures
//! - `ClientError`: failures surfaced by the client query/cache layer

use thiserror::Error;

/// Errors from the board repositories (tasks, chat, workspaces, analytics).
///
/// Data-access code works in `anyhow::Result`; repositories convert at their
/// boundary so the HTTP layer can map each variant to a status code.
#[derive(Debug, Error)]
pub enum BoardError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("{0}")]
    Validation(String),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BoardError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

pub type BoardResult<T> = Result<T, BoardError>;

/// Errors from the HTTP client and cache layer.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Server returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Response missing data envelope")]
    MissingData,

    #[error("Failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid base URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },
}

impl ClientError {
    /// True for 401 responses (no session or not a member).
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ClientError::Api { status: 401, .. })
    }
}
