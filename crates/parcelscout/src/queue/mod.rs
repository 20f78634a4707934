//! Persistent job queue.
//!
//! Every transition runs inside one SQLite transaction behind the database
//! mutex, so dispatch is atomic: two workers can never claim the same job,
//! and a term never has two Active jobs at once.

pub mod backoff;
pub mod job;
pub mod maintenance;

use std::time::Duration;

use chrono::Utc;
use rusqlite::Connection;
use serde::Serialize;
use thiserror::Error;

use crate::config::{QueueConfig, MAX_PRIORITY};
use crate::db::job_repo::{self, JobFilter, JobRow};
use crate::db::{format_timestamp, Database, DatabaseError};
use crate::dedup::{SearchTermRecord, TermStatus};
use crate::retrieval::Strategy;

pub use backoff::BackoffPolicy;
pub use job::{Job, JobId, JobState, JobStatus};
pub use maintenance::{MaintenanceReport, MaintenanceScheduler};

/// Longest search term accepted.
pub const MAX_TERM_CHARS: usize = 200;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Invalid job: {0}")]
    Validation(String),

    #[error("Job '{0}' not found")]
    NotFound(JobId),

    #[error("Cannot {action} job '{id}' in state {state}")]
    InvalidTransition {
        id: JobId,
        state: JobState,
        action: &'static str,
    },

    /// The job was reclaimed from this worker and belongs to someone else.
    #[error("Job '{id}' is no longer held by {worker_id}")]
    ClaimLost { id: JobId, worker_id: String },

    #[error("Queue storage error: {0}")]
    Database(#[from] DatabaseError),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Per-submission overrides.
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub max_attempts: Option<u32>,
    /// Skip the submission when a live job for the term already covers it.
    pub dedupe: bool,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            max_attempts: None,
            dedupe: true,
        }
    }
}

/// What `enqueue` did with a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Disposition {
    Created,
    /// A live job at equal or higher urgency already exists; its ID is returned.
    ExistingKept,
    /// Less urgent Waiting jobs for the term were superseded by the new one.
    Replaced { superseded: Vec<JobId> },
}

#[derive(Debug, Clone, Serialize)]
pub struct JobHandle {
    pub id: JobId,
    pub priority: i64,
    pub disposition: Disposition,
}

/// How the failure handler wants a failed attempt treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    /// False fails the job now regardless of remaining attempts.
    pub retry: bool,
    /// Delay before the job is dispatchable again.
    pub delay: Duration,
}

impl RetryDecision {
    pub fn retry_after(delay: Duration) -> Self {
        Self { retry: true, delay }
    }

    pub fn permanent() -> Self {
        Self {
            retry: false,
            delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    RetriedWithBackoff { attempt: u32, delay: Duration },
    Exhausted { attempt: u32 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub superseded: u64,
}

impl QueueCounts {
    /// Jobs still to be worked (Waiting plus Active).
    pub fn live(&self) -> u64 {
        self.waiting + self.active
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetryFailedReport {
    pub considered: usize,
    pub requeued: Vec<JobId>,
}

/// Listing filter for operator views.
#[derive(Debug, Clone, Default)]
pub struct JobQuery {
    pub state: Option<JobState>,
    pub search_term: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Trims a submitted term and rejects empty or oversized ones.
pub fn normalize_term(term: &str) -> Result<String> {
    let trimmed = term.trim();
    if trimmed.is_empty() {
        return Err(QueueError::Validation("search term is empty".to_string()));
    }
    if trimmed.chars().count() > MAX_TERM_CHARS {
        return Err(QueueError::Validation(format!(
            "search term exceeds {} characters",
            MAX_TERM_CHARS
        )));
    }
    if trimmed.chars().any(char::is_control) {
        return Err(QueueError::Validation(
            "search term contains control characters".to_string(),
        ));
    }
    Ok(trimmed.to_string())
}

#[derive(Clone)]
pub struct JobQueue {
    db: Database,
    default_priority: i64,
    max_attempts: u32,
    backoff: BackoffPolicy,
}

impl JobQueue {
    pub fn new(db: Database, config: &QueueConfig) -> Self {
        Self {
            db,
            default_priority: config.default_priority,
            max_attempts: config.max_attempts,
            backoff: BackoffPolicy::from_config(config),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    pub fn default_priority(&self) -> i64 {
        self.default_priority
    }

    /// Submits a term and returns the ID of the job that will cover it.
    pub fn submit(
        &self,
        term: &str,
        priority: Option<i64>,
        options: Option<EnqueueOptions>,
    ) -> Result<JobId> {
        let handle = self.enqueue(
            term,
            priority.unwrap_or(self.default_priority),
            options.unwrap_or_default(),
        )?;
        Ok(handle.id)
    }

    /// Enqueues a term at `priority` (lower is more urgent).
    ///
    /// With `dedupe`, an Active job for the term, or a Waiting one at equal or
    /// higher urgency, absorbs the submission. Less urgent Waiting jobs are
    /// superseded by the new job in the same transaction.
    pub fn enqueue(&self, term: &str, priority: i64, options: EnqueueOptions) -> Result<JobHandle> {
        let term = normalize_term(term)?;
        if !(0..=MAX_PRIORITY).contains(&priority) {
            return Err(QueueError::Validation(format!(
                "priority {} outside 0..={}",
                priority, MAX_PRIORITY
            )));
        }
        let max_attempts = options.max_attempts.unwrap_or(self.max_attempts);
        if max_attempts == 0 {
            return Err(QueueError::Validation(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        let handle = self.db.with_transaction(|tx| {
            let now = format_timestamp(Utc::now());
            let mut superseded = Vec::new();

            if options.dedupe {
                let live = job_repo::find_live_by_term(tx, &term)?;
                let keeper = live
                    .iter()
                    .find(|j| j.state == job_repo::STATE_ACTIVE)
                    .or_else(|| live.iter().find(|j| j.priority <= priority));
                if let Some(existing) = keeper {
                    return Ok(JobHandle {
                        id: JobId::from(existing.id.clone()),
                        priority: existing.priority,
                        disposition: Disposition::ExistingKept,
                    });
                }

                let new_id = JobId::generate();
                for waiting in &live {
                    if job_repo::supersede(tx, &waiting.id, Some(new_id.as_str()), &now)? {
                        superseded.push(JobId::from(waiting.id.clone()));
                    }
                }
                insert_waiting(tx, &new_id, &term, priority, max_attempts, &now)?;
                let disposition = if superseded.is_empty() {
                    Disposition::Created
                } else {
                    Disposition::Replaced { superseded }
                };
                return Ok(JobHandle {
                    id: new_id,
                    priority,
                    disposition,
                });
            }

            let new_id = JobId::generate();
            insert_waiting(tx, &new_id, &term, priority, max_attempts, &now)?;
            Ok(JobHandle {
                id: new_id,
                priority,
                disposition: Disposition::Created,
            })
        })?;

        match handle.disposition {
            Disposition::Created => {
                log::debug!("Enqueued job {} for '{}' at priority {}", handle.id, term, priority)
            }
            Disposition::ExistingKept => {
                log::debug!("'{}' already covered by live job {}", term, handle.id)
            }
            Disposition::Replaced { ref superseded } => log::info!(
                "Job {} for '{}' at priority {} superseded {} less urgent job(s)",
                handle.id,
                term,
                priority,
                superseded.len()
            ),
        }
        Ok(handle)
    }

    /// Claims the next dispatchable job for `worker_id`.
    pub fn dequeue(&self, worker_id: &str) -> Result<Option<Job>> {
        let job = self.db.with_transaction(|tx| {
            let now = format_timestamp(Utc::now());
            let Some(row) = job_repo::next_dispatchable(tx, &now)? else {
                return Ok(None);
            };
            if !job_repo::mark_active(tx, &row.id, worker_id, &now)? {
                return Ok(None);
            }
            let claimed = job_repo::find_by_id(tx, &row.id)?;
            claimed.map(Job::try_from).transpose()
        })?;

        if let Some(ref job) = job {
            log::debug!("Dispatched job {} ('{}') to {}", job.id, job.search_term, worker_id);
        }
        Ok(job)
    }

    /// Marks a job Completed. Only the worker currently holding the claim
    /// may complete it.
    pub fn complete(
        &self,
        id: &JobId,
        worker_id: &str,
        result_count: u64,
        strategy: Option<Strategy>,
    ) -> Result<()> {
        let count = i64::try_from(result_count).unwrap_or(i64::MAX);
        self.db.with_transaction(|tx| {
            let now = format_timestamp(Utc::now());
            let strategy = strategy.map(|s| s.as_str());
            if job_repo::mark_completed(tx, id.as_str(), worker_id, count, strategy, &now)? {
                return Ok(Ok(()));
            }
            Ok(Err(claim_error(tx, id, worker_id, "complete")?))
        })?
    }

    /// Records a failed attempt using the queue's own backoff.
    pub fn fail(&self, id: &JobId, worker_id: &str, error: &str) -> Result<FailOutcome> {
        let attempt = self.find_by_id(id)?.map(|j| j.attempt).unwrap_or(0);
        self.fail_with(
            id,
            worker_id,
            error,
            RetryDecision::retry_after(self.backoff.delay_for(attempt)),
        )
    }

    /// Records a failed attempt. The job returns to Waiting after the
    /// decision's delay unless it is out of attempts or the decision is
    /// `Permanent`, in which case it ends Failed with `error` verbatim.
    pub fn fail_with(
        &self,
        id: &JobId,
        worker_id: &str,
        error: &str,
        decision: RetryDecision,
    ) -> Result<FailOutcome> {
        let outcome = self.db.with_transaction(|tx| {
            let now_at = Utc::now();
            let Some(row) = job_repo::find_by_id(tx, id.as_str())? else {
                return Ok(Err(QueueError::NotFound(id.clone())));
            };
            if row.state != job_repo::STATE_ACTIVE || row.worker_id.as_deref() != Some(worker_id) {
                return Ok(Err(claim_error(tx, id, worker_id, "fail")?));
            }
            let retry = decision.retry.then_some(decision.delay);
            Ok(Ok(record_failure(tx, &row, worker_id, error, retry, now_at)?))
        })??;

        match outcome {
            FailOutcome::RetriedWithBackoff { attempt, delay } => log::info!(
                "Job {} failed attempt {}, retrying in {}s",
                id,
                attempt,
                delay.as_secs()
            ),
            FailOutcome::Exhausted { attempt } => {
                log::warn!("Job {} failed after {} attempt(s): {}", id, attempt, error)
            }
        }
        Ok(outcome)
    }

    /// Returns an Active job to Waiting without consuming an attempt.
    pub fn requeue(&self, id: &JobId) -> Result<()> {
        self.db.with_transaction(|tx| {
            let now = format_timestamp(Utc::now());
            if job_repo::requeue(tx, id.as_str(), &now)? {
                return Ok(Ok(()));
            }
            Ok(Err(transition_error(tx, id, "requeue")?))
        })?
    }

    /// Takes back Active jobs that started more than `threshold` ago. The
    /// lost run counts as a failed attempt, so a job that keeps stalling its
    /// worker ends Failed once its attempts run out. Returns how many jobs
    /// were taken back.
    pub fn reclaim_stale(&self, threshold: Duration) -> Result<usize> {
        let now_at = Utc::now();
        let cutoff = now_at
            - chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::days(1));
        let outcomes = self.db.with_transaction(|tx| {
            let stale = job_repo::stale_active(tx, &format_timestamp(cutoff))?;
            let mut outcomes = Vec::with_capacity(stale.len());
            for row in &stale {
                let Some(worker_id) = row.worker_id.as_deref() else {
                    if job_repo::requeue(tx, &row.id, &format_timestamp(now_at))? {
                        outcomes.push(None);
                    }
                    continue;
                };
                let error = format!(
                    "Worker {} did not report within {}s",
                    worker_id,
                    threshold.as_secs()
                );
                let delay = self.backoff.delay_for(row.attempt);
                let outcome = record_failure(tx, row, worker_id, &error, Some(delay), now_at)?;
                outcomes.push(Some(outcome));
            }
            Ok(outcomes)
        })?;

        let exhausted = outcomes
            .iter()
            .filter(|o| matches!(o, Some(FailOutcome::Exhausted { .. })))
            .count();
        if !outcomes.is_empty() {
            log::warn!(
                "Reclaimed {} stale active job(s), {} out of attempts",
                outcomes.len(),
                exhausted
            );
        }
        Ok(outcomes.len())
    }

    /// Resubmits up to `limit` terms whose jobs all ended Failed.
    pub fn retry_failed(&self, limit: u64) -> Result<RetryFailedReport> {
        let terms = self
            .db
            .with_conn(|conn| job_repo::failed_only_terms(conn, limit))?;
        let mut report = RetryFailedReport {
            considered: terms.len(),
            requeued: Vec::new(),
        };
        for term in terms {
            let handle = self.enqueue(&term, self.default_priority, EnqueueOptions::default())?;
            if handle.disposition != Disposition::ExistingKept {
                report.requeued.push(handle.id);
            }
        }
        Ok(report)
    }

    pub fn counts(&self) -> Result<QueueCounts> {
        Ok(self.db.with_conn(|conn| {
            Ok(QueueCounts {
                waiting: job_repo::count_by_state(conn, job_repo::STATE_WAITING)?,
                active: job_repo::count_by_state(conn, job_repo::STATE_ACTIVE)?,
                completed: job_repo::count_by_state(conn, job_repo::STATE_COMPLETED)?,
                failed: job_repo::count_by_state(conn, job_repo::STATE_FAILED)?,
                superseded: job_repo::count_by_state(conn, job_repo::STATE_SUPERSEDED)?,
            })
        })?)
    }

    pub fn find_by_id(&self, id: &JobId) -> Result<Option<Job>> {
        Ok(self.db.with_conn(|conn| {
            job_repo::find_by_id(conn, id.as_str())?
                .map(Job::try_from)
                .transpose()
        })?)
    }

    /// Finds the job that currently represents a term: the most urgent live
    /// job, otherwise the latest one in any state.
    pub fn find(&self, term: &str) -> Result<Option<Job>> {
        let term = normalize_term(term)?;
        Ok(self.db.with_conn(|conn| {
            let row = match job_repo::find_live_by_term(conn, &term)?.into_iter().next() {
                Some(row) => Some(row),
                None => job_repo::find_latest_by_term(conn, &term)?,
            };
            row.map(Job::try_from).transpose()
        })?)
    }

    pub fn status(&self, id: &JobId) -> Result<JobStatus> {
        self.find_by_id(id)?
            .map(JobStatus::from)
            .ok_or_else(|| QueueError::NotFound(id.clone()))
    }

    /// Lists jobs newest first with the total matching count.
    pub fn recent(&self, query: &JobQuery) -> Result<(Vec<Job>, u64)> {
        let filter = JobFilter {
            state: query.state.map(|s| s.as_str().to_string()),
            search_term: query.search_term.clone(),
            limit: query.limit,
            offset: query.offset,
            ..Default::default()
        };
        Ok(self.db.with_conn(|conn| {
            let (rows, total) = job_repo::query(conn, &filter)?;
            let jobs = rows
                .into_iter()
                .map(Job::try_from)
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok((jobs, total))
        })?)
    }

    /// Every term that has ever been queued, in any state.
    pub fn known_terms(&self) -> Result<Vec<String>> {
        Ok(self.db.with_conn(job_repo::distinct_terms)?)
    }

    /// Live jobs ordered by term, then most urgent and oldest first.
    pub fn live_jobs(&self) -> Result<Vec<Job>> {
        Ok(self.db.with_conn(|conn| {
            job_repo::live_jobs(conn)?
                .into_iter()
                .map(Job::try_from)
                .collect()
        })?)
    }

    /// Marks a Waiting job superseded. Returns false if it was no longer Waiting.
    pub fn supersede(&self, id: &JobId, by: Option<&JobId>) -> Result<bool> {
        Ok(self.db.with_transaction(|tx| {
            job_repo::supersede(
                tx,
                id.as_str(),
                by.map(JobId::as_str),
                &format_timestamp(Utc::now()),
            )
        })?)
    }

    /// Coverage of each term, read under a single lock.
    pub fn coverage(&self, terms: &[String]) -> Result<Vec<SearchTermRecord>> {
        Ok(self.db.with_conn(|conn| {
            terms
                .iter()
                .map(|term| {
                    let term = term.trim();
                    if job_repo::has_completed(conn, term)? {
                        return Ok(SearchTermRecord::new(term, TermStatus::Completed));
                    }
                    let live = job_repo::find_live_by_term(conn, term)?;
                    Ok(match live.first() {
                        Some(best) => SearchTermRecord::new(
                            term,
                            TermStatus::PendingInQueue {
                                priority: best.priority,
                                active: live.iter().any(|job| job.state == job_repo::STATE_ACTIVE),
                            },
                        ),
                        None => SearchTermRecord::new(term, TermStatus::NeverTried),
                    })
                })
                .collect()
        })?)
    }
}

fn insert_waiting(
    conn: &Connection,
    id: &JobId,
    term: &str,
    priority: i64,
    max_attempts: u32,
    now: &str,
) -> std::result::Result<(), DatabaseError> {
    job_repo::insert(
        conn,
        &JobRow {
            seq: 0,
            id: id.to_string(),
            search_term: term.to_string(),
            priority,
            attempt: 0,
            max_attempts,
            state: job_repo::STATE_WAITING.to_string(),
            worker_id: None,
            available_at: now.to_string(),
            created_at: now.to_string(),
            updated_at: now.to_string(),
            started_at: None,
            completed_at: None,
            result_count: None,
            strategy: None,
            last_error: None,
            superseded_by: None,
        },
    )?;
    Ok(())
}

/// Builds the error for a transition that matched no row.
fn transition_error(
    conn: &Connection,
    id: &JobId,
    action: &'static str,
) -> std::result::Result<QueueError, DatabaseError> {
    Ok(match job_repo::find_by_id(conn, id.as_str())? {
        None => QueueError::NotFound(id.clone()),
        Some(row) => match JobState::parse(&row.state) {
            Some(state) => QueueError::InvalidTransition {
                id: id.clone(),
                state,
                action,
            },
            None => QueueError::Database(DatabaseError::Conversion(format!(
                "job {} has unknown state '{}'",
                row.id, row.state
            ))),
        },
    })
}

/// Builds the error for a worker-scoped transition that matched no row.
fn claim_error(
    conn: &Connection,
    id: &JobId,
    worker_id: &str,
    action: &'static str,
) -> std::result::Result<QueueError, DatabaseError> {
    if let Some(row) = job_repo::find_by_id(conn, id.as_str())? {
        if row.state == job_repo::STATE_ACTIVE && row.worker_id.as_deref() != Some(worker_id) {
            return Ok(QueueError::ClaimLost {
                id: id.clone(),
                worker_id: worker_id.to_string(),
            });
        }
    }
    transition_error(conn, id, action)
}

/// Consumes one attempt of an Active job. With `retry` set and attempts
/// left, the job waits out the delay; otherwise it ends Failed.
fn record_failure(
    conn: &Connection,
    row: &JobRow,
    worker_id: &str,
    error: &str,
    retry: Option<Duration>,
    now_at: chrono::DateTime<Utc>,
) -> std::result::Result<FailOutcome, DatabaseError> {
    let now = format_timestamp(now_at);
    let attempt = row.attempt + 1;
    match retry {
        Some(delay) if attempt < row.max_attempts => {
            let available_at = now_at
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(1));
            job_repo::mark_retry(
                conn,
                &row.id,
                worker_id,
                attempt,
                error,
                &format_timestamp(available_at),
                &now,
            )?;
            Ok(FailOutcome::RetriedWithBackoff { attempt, delay })
        }
        _ => {
            job_repo::mark_failed(conn, &row.id, worker_id, attempt, error, &now)?;
            Ok(FailOutcome::Exhausted { attempt })
        }
    }
}
