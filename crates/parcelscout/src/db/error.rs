use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Cannot create database directory '{path}': {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Schema migration v{version} failed: {reason}")]
    Migration { version: u32, reason: String },

    /// A stored value does not map back to its domain type (e.g. an unknown
    /// job state written by a newer build).
    #[error("Invalid stored value: {0}")]
    Conversion(String),

    /// A thread panicked while holding the connection.
    #[error("Database connection lock poisoned")]
    LockPoisoned,
}
