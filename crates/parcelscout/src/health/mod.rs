//! Health surface for operational tooling.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::{format_timestamp, outcome_repo};
use crate::queue::{JobId, JobQueue, QueueCounts, QueueError};
use crate::token::{TokenHealth, TokenManager};

/// One failed job attempt, kept for operators.
#[derive(Debug, Clone, Serialize)]
pub struct JobErrorEntry {
    pub job_id: JobId,
    pub search_term: String,
    pub attempt: u32,
    /// The job ended Failed with this error.
    pub terminal: bool,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// Fixed-capacity ring of the most recent job errors.
pub struct RecentErrors {
    entries: Mutex<VecDeque<JobErrorEntry>>,
    capacity: usize,
}

impl RecentErrors {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, entry: JobErrorEntry) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Newest first.
    pub fn snapshot(&self) -> Vec<JobErrorEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub queue: QueueCounts,
    pub token: TokenHealth,
    pub recent_errors: Vec<JobErrorEntry>,
    /// Outcome counts by status over the last hour.
    pub outcomes_last_hour: BTreeMap<String, u64>,
    pub generated_at: DateTime<Utc>,
}

pub struct HealthMonitor {
    queue: JobQueue,
    tokens: Arc<TokenManager>,
    errors: Arc<RecentErrors>,
}

impl HealthMonitor {
    pub fn new(queue: JobQueue, tokens: Arc<TokenManager>, errors: Arc<RecentErrors>) -> Self {
        Self {
            queue,
            tokens,
            errors,
        }
    }

    pub fn snapshot(&self) -> Result<HealthReport, QueueError> {
        let generated_at = Utc::now();
        let since = format_timestamp(generated_at - chrono::Duration::hours(1));
        let outcomes_last_hour = outcome_repo::count_by_status_since(self.queue.database(), &since)?
            .into_iter()
            .collect();

        Ok(HealthReport {
            queue: self.queue.counts()?,
            token: self.tokens.health(),
            recent_errors: self.errors.snapshot(),
            outcomes_last_hour,
            generated_at,
        })
    }
}
