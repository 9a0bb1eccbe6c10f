use crate::validator::Rejection;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QuestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid level definition: {0}")]
    InvalidLevel(String),

    #[error("Sandbox setup failed for {key}: {source}")]
    Setup {
        key: String,
        #[source]
        source: rusqlite::Error,
    },
}

/// Every way a query submission can fail. The display text is exactly the
/// `error` string reported back in a `QueryResult`.
#[derive(Debug, Error)]
pub enum QueryFailure {
    #[error("Invalid level")]
    UnknownLevel,

    #[error("{0}")]
    Policy(#[from] Rejection),

    #[error("SQL Error: {0}")]
    Engine(String),

    #[error("System error: {0}")]
    System(#[from] QuestError),
}
