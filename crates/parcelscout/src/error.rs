use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParcelScoutError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] crate::queue::QueueError),

    #[error("Retrieval error: {0}")]
    Retrieval(#[from] crate::retrieval::RetrievalError),

    #[error("Token error: {0}")]
    Token(#[from] crate::token::TokenError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Secret error: {0}")]
    Secret(#[from] crate::secrets::SecretError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config YAML: {0}")]
    ParseYaml(#[from] serde_yaml::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Invalid URL for '{field}': {reason}")]
    InvalidUrl { field: String, reason: String },

    #[error("Invalid term category '{name}': {reason}")]
    InvalidCategory { name: String, reason: String },
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Record '{external_id}' is missing its assessment year")]
    MissingPartitionKey { external_id: String },
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("Failed to build retrieval engine: {0}")]
    EngineSetup(String),
}

pub type Result<T> = std::result::Result<T, ParcelScoutError>;
