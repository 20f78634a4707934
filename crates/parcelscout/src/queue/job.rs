use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::job_repo::{self, JobRow};
use crate::db::{parse_timestamp, DatabaseError};

/// Queue-assigned job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    /// Replaced by a more urgent job for the same term, or collapsed by the
    /// duplicate sweep. Terminal and not part of the live queue.
    Superseded,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => job_repo::STATE_WAITING,
            Self::Active => job_repo::STATE_ACTIVE,
            Self::Completed => job_repo::STATE_COMPLETED,
            Self::Failed => job_repo::STATE_FAILED,
            Self::Superseded => job_repo::STATE_SUPERSEDED,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            job_repo::STATE_WAITING => Some(Self::Waiting),
            job_repo::STATE_ACTIVE => Some(Self::Active),
            job_repo::STATE_COMPLETED => Some(Self::Completed),
            job_repo::STATE_FAILED => Some(Self::Failed),
            job_repo::STATE_SUPERSEDED => Some(Self::Superseded),
            _ => None,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Self::Waiting | Self::Active)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_live()
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work: a single search term.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    pub search_term: String,
    /// Lower is more urgent.
    pub priority: i64,
    pub attempt: u32,
    pub max_attempts: u32,
    pub state: JobState,
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Earliest time the job may be dispatched (backoff).
    pub available_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result_count: Option<u64>,
    pub strategy: Option<String>,
    pub last_error: Option<String>,
    pub superseded_by: Option<JobId>,
}

impl TryFrom<JobRow> for Job {
    type Error = DatabaseError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let state = JobState::parse(&row.state).ok_or_else(|| {
            DatabaseError::Conversion(format!("job {} has unknown state '{}'", row.id, row.state))
        })?;

        Ok(Self {
            id: JobId(row.id),
            search_term: row.search_term,
            priority: row.priority,
            attempt: row.attempt,
            max_attempts: row.max_attempts,
            state,
            worker_id: row.worker_id,
            created_at: parse_timestamp(&row.created_at),
            available_at: parse_timestamp(&row.available_at),
            started_at: row.started_at.as_deref().map(parse_timestamp),
            completed_at: row.completed_at.as_deref().map(parse_timestamp),
            result_count: row.result_count.map(|c| c.max(0) as u64),
            strategy: row.strategy,
            last_error: row.last_error,
            superseded_by: row.superseded_by.map(JobId),
        })
    }
}

/// Operator-facing view of a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub id: JobId,
    pub search_term: String,
    pub state: JobState,
    pub priority: i64,
    pub attempt: u32,
    pub max_attempts: u32,
    pub result_count: Option<u64>,
    /// Completed without matches, as opposed to failed.
    pub zero_results: bool,
    pub strategy: Option<String>,
    /// Last error message, verbatim.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<Job> for JobStatus {
    fn from(job: Job) -> Self {
        Self {
            zero_results: job.state == JobState::Completed && job.result_count == Some(0),
            id: job.id,
            search_term: job.search_term,
            state: job.state,
            priority: job.priority,
            attempt: job.attempt,
            max_attempts: job.max_attempts,
            result_count: job.result_count,
            strategy: job.strategy,
            error: job.last_error,
            created_at: job.created_at,
            available_at: job.available_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }
}
