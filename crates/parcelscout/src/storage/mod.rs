//! Persistence collaborator called by the workers.
//!
//! Results are upserted before a job is reported complete; outcomes are an
//! append-only log for operators.

pub mod sqlite;

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::error::StorageError;
use crate::queue::JobId;
use crate::retrieval::{ResultRecord, Strategy};

pub use sqlite::SqliteResultSink;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertCounts {
    pub inserted: u64,
    pub updated: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Completed,
    /// Failed attempt that will be retried.
    Retrying,
    Failed,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Retrying => "retrying",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attempt's outcome as seen by the worker.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job_id: JobId,
    pub search_term: String,
    pub status: OutcomeStatus,
    pub result_count: Option<u64>,
    pub strategy: Option<Strategy>,
    pub error: Option<String>,
    pub duration: Duration,
}

pub trait ResultSink: Send + Sync {
    fn upsert_results(&self, records: &[ResultRecord]) -> Result<UpsertCounts, StorageError>;

    fn record_job_outcome(&self, outcome: &JobOutcome) -> Result<(), StorageError>;
}
