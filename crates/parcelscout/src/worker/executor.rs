//! Executes one dequeued job end to end.
//!
//! Results are stored before the job is reported complete. Every failure
//! goes through [`decide_retry`], the single point that turns an error into
//! a retry-or-fail decision for the queue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;

use crate::error::StorageError;
use crate::health::{JobErrorEntry, RecentErrors};
use crate::queue::{
    normalize_term, BackoffPolicy, FailOutcome, Job, JobId, JobQueue, RetryDecision,
};
use crate::retrieval::{RetrievalEngine, RetrievalError, Strategy};
use crate::sanitize::truncate_body;
use crate::storage::{JobOutcome, OutcomeStatus, ResultSink};
use crate::token::TokenManager;

/// Longest error text stored on a job or outcome.
const MAX_ERROR_CHARS: usize = 1000;

/// Why one attempt at a job failed.
#[derive(Debug, Error)]
pub enum AttemptError {
    /// Carries the queue's validation message.
    #[error("{0}")]
    InvalidJob(String),

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error("Failed to store results: {0}")]
    Storage(#[from] StorageError),
}

impl AttemptError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::InvalidJob(_) => false,
            Self::Retrieval(e) => e.is_retryable(),
            Self::Storage(StorageError::MissingPartitionKey { .. }) => false,
            Self::Storage(_) => true,
        }
    }
}

/// Failure handler: permanent errors fail now; transient ones back off
/// exponentially, or longer when the source asked for it.
pub fn decide_retry(job: &Job, error: &AttemptError, backoff: &BackoffPolicy) -> RetryDecision {
    if !error.is_retryable() {
        return RetryDecision::permanent();
    }
    let mut delay = backoff.delay_for(job.attempt);
    if let AttemptError::Retrieval(RetrievalError::RateLimited {
        retry_after_secs: Some(secs),
    }) = error
    {
        delay = delay.max(Duration::from_secs(*secs));
    }
    RetryDecision::retry_after(delay)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum JobResult {
    Completed {
        result_count: u64,
        strategy: Strategy,
        inserted: u64,
        updated: u64,
    },
    Retrying {
        attempt: u32,
        delay_secs: u64,
        error: String,
    },
    Failed {
        attempt: u32,
        error: String,
    },
    /// The queue refused the final transition (e.g. the job was reclaimed).
    Lost {
        error: String,
    },
}

/// What a worker did with one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub worker_id: String,
    pub job_id: JobId,
    pub search_term: String,
    pub result: JobResult,
    pub duration_ms: u64,
}

/// Shared collaborators handed to every worker.
#[derive(Clone)]
pub struct WorkerContext {
    pub queue: JobQueue,
    pub tokens: Arc<TokenManager>,
    pub sink: Arc<dyn ResultSink>,
    pub errors: Arc<RecentErrors>,
}

/// Runs `job` under the engine's hard timeout and reports the outcome to the
/// queue, the result sink and the recent-error ring.
pub async fn execute(
    ctx: &WorkerContext,
    engine: &RetrievalEngine,
    worker_id: &str,
    job: Job,
) -> JobReport {
    let started = Instant::now();
    let result = match attempt(ctx, engine, &job).await {
        Ok((count, strategy, inserted, updated)) => {
            complete(ctx, worker_id, &job, count, strategy, inserted, updated, started.elapsed())
        }
        Err(e) => fail(ctx, worker_id, &job, e, started.elapsed()),
    };

    JobReport {
        worker_id: worker_id.to_string(),
        job_id: job.id,
        search_term: job.search_term,
        result,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

async fn attempt(
    ctx: &WorkerContext,
    engine: &RetrievalEngine,
    job: &Job,
) -> Result<(u64, Strategy, u64, u64), AttemptError> {
    let term = normalize_term(&job.search_term).map_err(|e| AttemptError::InvalidJob(e.to_string()))?;

    // Snapshot; a refresh in progress never blocks the job.
    let token = ctx.tokens.current();
    let limit = engine.job_timeout();
    let outcome = tokio::time::timeout(limit, engine.fetch(&term, token.as_ref().map(|t| &t.value)))
        .await
        .map_err(|_| RetrievalError::Timeout {
            strategy: "job",
            after: limit,
        })??;

    if outcome.skipped > 0 {
        log::debug!(
            "Job {}: {} row(s) without an identifier skipped",
            job.id,
            outcome.skipped
        );
    }
    if outcome.truncated {
        log::info!(
            "Job {} ('{}'): source reported more rows than were returned",
            job.id,
            term
        );
    }

    let counts = ctx.sink.upsert_results(&outcome.records)?;
    Ok((
        outcome.records.len() as u64,
        outcome.strategy,
        counts.inserted,
        counts.updated,
    ))
}

#[allow(clippy::too_many_arguments)]
fn complete(
    ctx: &WorkerContext,
    worker_id: &str,
    job: &Job,
    result_count: u64,
    strategy: Strategy,
    inserted: u64,
    updated: u64,
    elapsed: Duration,
) -> JobResult {
    if let Err(e) = ctx.queue.complete(&job.id, worker_id, result_count, Some(strategy)) {
        log::error!("Job {} finished but could not be completed: {}", job.id, e);
        return JobResult::Lost {
            error: e.to_string(),
        };
    }

    record(
        ctx,
        JobOutcome {
            job_id: job.id.clone(),
            search_term: job.search_term.clone(),
            status: OutcomeStatus::Completed,
            result_count: Some(result_count),
            strategy: Some(strategy),
            error: None,
            duration: elapsed,
        },
    );
    log::info!(
        "Job {} ('{}') completed via {}: {} record(s), {} new",
        job.id,
        job.search_term,
        strategy,
        result_count,
        inserted
    );

    JobResult::Completed {
        result_count,
        strategy,
        inserted,
        updated,
    }
}

fn fail(
    ctx: &WorkerContext,
    worker_id: &str,
    job: &Job,
    error: AttemptError,
    elapsed: Duration,
) -> JobResult {
    let decision = decide_retry(job, &error, &ctx.queue.backoff());
    let message = truncate_body(&error.to_string(), MAX_ERROR_CHARS);

    let outcome = match ctx.queue.fail_with(&job.id, worker_id, &message, decision) {
        Ok(outcome) => outcome,
        Err(e) => {
            log::error!("Job {} failed ({}) and could not be updated: {}", job.id, message, e);
            return JobResult::Lost {
                error: e.to_string(),
            };
        }
    };

    let (status, attempt, terminal) = match outcome {
        FailOutcome::RetriedWithBackoff { attempt, .. } => (OutcomeStatus::Retrying, attempt, false),
        FailOutcome::Exhausted { attempt } => (OutcomeStatus::Failed, attempt, true),
    };

    ctx.errors.push(JobErrorEntry {
        job_id: job.id.clone(),
        search_term: job.search_term.clone(),
        attempt,
        terminal,
        error: message.clone(),
        at: Utc::now(),
    });
    record(
        ctx,
        JobOutcome {
            job_id: job.id.clone(),
            search_term: job.search_term.clone(),
            status,
            result_count: None,
            strategy: None,
            error: Some(message.clone()),
            duration: elapsed,
        },
    );

    match outcome {
        FailOutcome::RetriedWithBackoff { attempt, delay } => JobResult::Retrying {
            attempt,
            delay_secs: delay.as_secs(),
            error: message,
        },
        FailOutcome::Exhausted { attempt } => JobResult::Failed {
            attempt,
            error: message,
        },
    }
}

fn record(ctx: &WorkerContext, outcome: JobOutcome) {
    if let Err(e) = ctx.sink.record_job_outcome(&outcome) {
        log::warn!("Failed to record outcome for job {}: {}", outcome.job_id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::JobState;

    fn job(attempt: u32) -> Job {
        Job {
            id: JobId::from("job-1"),
            search_term: "Smith".to_string(),
            priority: 5,
            attempt,
            max_attempts: 3,
            state: JobState::Active,
            worker_id: Some("worker-0".to_string()),
            created_at: Utc::now(),
            available_at: Utc::now(),
            started_at: Some(Utc::now()),
            completed_at: None,
            result_count: None,
            strategy: None,
            last_error: None,
            superseded_by: None,
        }
    }

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_secs(10), Duration::from_secs(600))
    }

    #[test]
    fn test_transient_errors_back_off() {
        let err = AttemptError::Retrieval(RetrievalError::Server {
            status: 503,
            body: "unavailable".to_string(),
        });
        assert_eq!(
            decide_retry(&job(2), &err, &policy()),
            RetryDecision::retry_after(Duration::from_secs(40))
        );
    }

    #[test]
    fn test_invalid_jobs_fail_permanently() {
        let err = AttemptError::InvalidJob("search term is empty".to_string());
        assert_eq!(decide_retry(&job(0), &err, &policy()), RetryDecision::permanent());

        let rejected = AttemptError::Retrieval(RetrievalError::Rejected {
            status: 400,
            body: "bad request".to_string(),
        });
        assert!(!decide_retry(&job(0), &rejected, &policy()).retry);
    }

    #[test]
    fn test_rate_limit_honours_retry_after() {
        let err = AttemptError::Retrieval(RetrievalError::RateLimited {
            retry_after_secs: Some(120),
        });
        assert_eq!(
            decide_retry(&job(0), &err, &policy()),
            RetryDecision::retry_after(Duration::from_secs(120))
        );
    }

    #[test]
    fn test_storage_errors_are_retried() {
        let err = AttemptError::Storage(StorageError::Database(
            crate::db::DatabaseError::LockPoisoned,
        ));
        assert!(decide_retry(&job(0), &err, &policy()).retry);
    }
}
