pub mod config;
pub mod db;
pub mod dedup;
pub mod error;
pub mod generator;
pub mod health;
pub mod queue;
pub mod retrieval;
pub mod sanitize;
pub mod secrets;
pub mod storage;
pub mod token;
pub mod worker;

pub use config::{load_config, Config};
pub use db::Database;
pub use dedup::{DedupPlanner, SearchTermRecord, SweepReport, TermStatus};
pub use error::{ConfigError, ParcelScoutError, Result, StorageError, WorkerError};
pub use generator::{FeederAction, QueueFeeder, SearchTermGenerator};
pub use health::{HealthMonitor, HealthReport, RecentErrors};
pub use queue::{
    EnqueueOptions, FailOutcome, Job, JobId, JobQueue, JobState, JobStatus, QueueCounts,
    QueueError, RetryDecision,
};
pub use retrieval::{FetchOutcome, RetrievalEngine, RetrievalError, ResultRecord, Strategy};
pub use secrets::{resolve_secret, resolve_secret_optional, SecretError, TokenEncryptor};
pub use storage::{ResultSink, SqliteResultSink};
pub use token::{TokenError, TokenHealth, TokenManager, TokenStore};
pub use worker::{JobReport, WorkerContext, WorkerPool};
