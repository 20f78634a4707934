//! Coverage planning and duplicate collapsing for the job queue.
//!
//! `plan` only reads. The keep-most-urgent replacement itself happens inside
//! `JobQueue::enqueue`, so a crash between planning and enqueueing leaves the
//! queue consistent.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::queue::{JobId, JobQueue, JobState, QueueError};

/// Where a term stands against the job history and the live queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum TermStatus {
    /// No Completed or live job. Terms whose jobs all failed land here too.
    NeverTried,
    /// A Completed job exists, whatever its result count.
    Completed,
    /// A Waiting or Active job exists; `priority` is the most urgent one.
    /// `active` is set when one of them is already claimed by a worker,
    /// which absorbs any further submission for the term.
    PendingInQueue { priority: i64, active: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchTermRecord {
    pub term: String,
    #[serde(flatten)]
    pub status: TermStatus,
}

impl SearchTermRecord {
    pub fn new(term: &str, status: TermStatus) -> Self {
        Self {
            term: term.to_string(),
            status,
        }
    }

    /// Whether a candidate at `priority` is still worth enqueuing.
    pub fn worth_enqueuing(&self, priority: i64) -> bool {
        match self.status {
            TermStatus::NeverTried => true,
            TermStatus::Completed => false,
            TermStatus::PendingInQueue { active: true, .. } => false,
            TermStatus::PendingInQueue {
                priority: queued, ..
            } => priority < queued,
        }
    }
}

/// Outcome of a duplicate sweep. Partial success is reported, not raised.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    /// Terms that had more than one live job.
    pub groups: usize,
    pub removed: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

#[derive(Clone)]
pub struct DedupPlanner {
    queue: JobQueue,
}

impl DedupPlanner {
    pub fn new(queue: JobQueue) -> Self {
        Self { queue }
    }

    /// Returns the candidates still worth enqueuing at `priority`, in input
    /// order. Blank candidates and case-insensitive repeats are dropped.
    pub fn plan(&self, candidates: &[String], priority: i64) -> Result<Vec<String>, QueueError> {
        let mut seen = HashSet::new();
        let unique: Vec<String> = candidates
            .iter()
            .map(|c| c.trim())
            .filter(|c| !c.is_empty() && seen.insert(c.to_lowercase()))
            .map(str::to_string)
            .collect();

        let coverage = self.queue.coverage(&unique)?;
        let planned: Vec<String> = coverage
            .into_iter()
            .filter(|record| record.worth_enqueuing(priority))
            .map(|record| record.term)
            .collect();

        log::debug!(
            "Planned {} of {} candidate term(s) at priority {}",
            planned.len(),
            candidates.len(),
            priority
        );
        Ok(planned)
    }

    pub fn coverage(&self, terms: &[String]) -> Result<Vec<SearchTermRecord>, QueueError> {
        self.queue.coverage(terms)
    }

    /// Collapses duplicate live jobs per term. The survivor is the Active job
    /// if there is one, else the most urgent, ties going to the earliest.
    /// Losers are superseded; an Active loser cannot be and counts as failed.
    pub fn sweep(&self) -> Result<SweepReport, QueueError> {
        let live = self.queue.live_jobs()?;

        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<_>> = HashMap::new();
        for job in live {
            let key = job.search_term.to_lowercase();
            if !groups.contains_key(&key) {
                order.push(key.clone());
            }
            groups.entry(key).or_default().push(job);
        }

        let mut report = SweepReport::default();
        for key in order {
            let Some(jobs) = groups.remove(&key) else {
                continue;
            };
            if jobs.len() < 2 {
                continue;
            }
            report.groups += 1;

            // Jobs arrive most urgent and oldest first.
            let survivor = jobs
                .iter()
                .position(|j| j.state == JobState::Active)
                .unwrap_or(0);
            let survivor_id: JobId = jobs[survivor].id.clone();

            for (i, job) in jobs.iter().enumerate() {
                if i == survivor {
                    continue;
                }
                if job.state == JobState::Active {
                    report.failed += 1;
                    report
                        .errors
                        .push(format!("job {} for '{}' is active", job.id, job.search_term));
                    continue;
                }
                match self.queue.supersede(&job.id, Some(&survivor_id)) {
                    Ok(true) => report.removed += 1,
                    Ok(false) => {
                        report.failed += 1;
                        report
                            .errors
                            .push(format!("job {} was no longer waiting", job.id));
                    }
                    Err(e) => {
                        report.failed += 1;
                        report.errors.push(format!("job {}: {}", job.id, e));
                    }
                }
            }
        }

        if report.groups > 0 {
            log::info!(
                "Duplicate sweep: {} group(s), {} removed, {} failed",
                report.groups,
                report.removed,
                report.failed
            );
        }
        Ok(report)
    }
}
