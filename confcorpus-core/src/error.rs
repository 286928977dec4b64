//! Error types for confcorpus-core

use thiserror::Error;

/// Boxed error returned by fetch collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Main error type for the confcorpus-core library
#[derive(Error, Debug)]
pub enum Error {
    /// The backing store could not be opened or is corrupt
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Query text could not be prepared
    #[error("query syntax error: {message} in `{query}`")]
    QuerySyntax { query: String, message: String },

    /// Query prepared but failed while running
    #[error("query execution error: {message} in `{query}`")]
    QueryExecution { query: String, message: String },

    /// A source's fetch collaborator failed
    #[error("fetching {entity_kind} from {source_id} failed: {cause}")]
    FetchFailed {
        source_id: String,
        entity_kind: String,
        #[source]
        cause: BoxError,
    },

    /// A source id was registered twice
    #[error("data source already registered: {0}")]
    DuplicateSource(String),

    /// Unknown source id
    #[error("data source not found: {0}")]
    SourceNotFound(String),

    /// Table name outside `[A-Za-z0-9_]+`
    #[error("invalid table name: {0:?}")]
    InvalidTableName(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV read/write error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Record data that does not have the expected shape
    #[error("malformed records: {0}")]
    Malformed(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this failure concerns the shared store rather than a single source.
    ///
    /// Cross-cutting failures abort a full load; everything else is reported per source.
    pub fn is_cross_cutting(&self) -> bool {
        matches!(
            self,
            Error::StorageUnavailable(_)
                | Error::Database(_)
                | Error::QuerySyntax { .. }
                | Error::QueryExecution { .. }
        )
    }
}

/// Result type alias for confcorpus-core
pub type Result<T> = std::result::Result<T, Error>;
