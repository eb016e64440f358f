use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum OpdexError {
    #[error("Collection {0} does not exist")]
    CollectionNotFound(String),

    #[error("Collection {0} is soft deleted")]
    CollectionSoftDeleted(String),

    #[error("Collection {0} not found (deleted)")]
    CollectionDeleted(String),

    #[error("Collection {0} already exists")]
    CollectionAlreadyExists(String),

    #[error("Invalid mutation: {0}")]
    InvalidMutation(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Corrupt operation log: {0}")]
    CorruptLog(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, OpdexError>;

impl From<std::io::Error> for OpdexError {
    fn from(e: std::io::Error) -> Self {
        OpdexError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for OpdexError {
    fn from(e: serde_json::Error) -> Self {
        OpdexError::Json(e.to_string())
    }
}

impl From<tempfile::PersistError> for OpdexError {
    fn from(e: tempfile::PersistError) -> Self {
        OpdexError::Io(e.error.to_string())
    }
}

impl OpdexError {
    /// True for every variant that means "this collection cannot be served":
    /// absent, soft deleted, or fully deleted.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            OpdexError::CollectionNotFound(_)
                | OpdexError::CollectionSoftDeleted(_)
                | OpdexError::CollectionDeleted(_)
        )
    }
}
