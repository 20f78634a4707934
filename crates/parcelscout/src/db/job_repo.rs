//! Job repository: SQL operations on the `jobs` table.
//!
//! Functions take a `&Connection` so the queue can compose several of them
//! inside one transaction (`Database::with_transaction` hands out a
//! `Transaction`, which derefs to `Connection`).

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::DatabaseError;

pub const STATE_WAITING: &str = "waiting";
pub const STATE_ACTIVE: &str = "active";
pub const STATE_COMPLETED: &str = "completed";
pub const STATE_FAILED: &str = "failed";
pub const STATE_SUPERSEDED: &str = "superseded";

/// A raw job row from the database.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub seq: i64,
    pub id: String,
    pub search_term: String,
    pub priority: i64,
    pub attempt: u32,
    pub max_attempts: u32,
    pub state: String,
    pub worker_id: Option<String>,
    pub available_at: String,
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub result_count: Option<i64>,
    pub strategy: Option<String>,
    pub last_error: Option<String>,
    pub superseded_by: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            seq: row.get("seq")?,
            id: row.get("id")?,
            search_term: row.get("search_term")?,
            priority: row.get("priority")?,
            attempt: row.get("attempt")?,
            max_attempts: row.get("max_attempts")?,
            state: row.get("state")?,
            worker_id: row.get("worker_id")?,
            available_at: row.get("available_at")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            result_count: row.get("result_count")?,
            strategy: row.get("strategy")?,
            last_error: row.get("last_error")?,
            superseded_by: row.get("superseded_by")?,
        })
    }
}

/// Query filter parameters for job listing.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub state: Option<String>,
    pub search_term: Option<String>,
    pub from_date: Option<String>,
    pub to_date: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Inserts a new job row. `seq` is assigned by SQLite and ignored here.
pub fn insert(conn: &Connection, job: &JobRow) -> Result<i64, DatabaseError> {
    conn.execute(
        "INSERT INTO jobs (id, search_term, priority, attempt, max_attempts, state, worker_id,
         available_at, created_at, updated_at, started_at, completed_at, result_count,
         strategy, last_error, superseded_by)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            job.id,
            job.search_term,
            job.priority,
            job.attempt,
            job.max_attempts,
            job.state,
            job.worker_id,
            job.available_at,
            job.created_at,
            job.updated_at,
            job.started_at,
            job.completed_at,
            job.result_count,
            job.strategy,
            job.last_error,
            job.superseded_by,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Finds a job by its ID.
pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM jobs WHERE id = ?1",
            params![id],
            JobRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Returns the Waiting and Active jobs for a term, most urgent first,
/// earliest first within a priority.
pub fn find_live_by_term(conn: &Connection, term: &str) -> Result<Vec<JobRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM jobs WHERE search_term = ?1 AND state IN ('waiting', 'active')
         ORDER BY priority ASC, seq ASC",
    )?;
    let rows = stmt
        .query_map(params![term], JobRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Returns the most recently created job for a term in any state.
pub fn find_latest_by_term(conn: &Connection, term: &str) -> Result<Option<JobRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM jobs WHERE search_term = ?1 ORDER BY seq DESC LIMIT 1",
            params![term],
            JobRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Returns whether a Completed job exists for the term.
pub fn has_completed(conn: &Connection, term: &str) -> Result<bool, DatabaseError> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM jobs WHERE search_term = ?1 AND state = 'completed')",
        params![term],
        |r| r.get(0),
    )?;
    Ok(exists)
}

/// Selects the next dispatchable job: Waiting, past its backoff, and not
/// sharing a term with an Active job. Priority ascending, then FIFO.
pub fn next_dispatchable(conn: &Connection, now: &str) -> Result<Option<JobRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM jobs j
             WHERE j.state = 'waiting' AND j.available_at <= ?1
               AND NOT EXISTS (
                   SELECT 1 FROM jobs a
                   WHERE a.state = 'active' AND a.search_term = j.search_term
               )
             ORDER BY j.priority ASC, j.seq ASC
             LIMIT 1",
            params![now],
            JobRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Transitions a Waiting job to Active. Returns false if the job was not
/// Waiting any more.
pub fn mark_active(
    conn: &Connection,
    id: &str,
    worker_id: &str,
    now: &str,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE jobs SET state = 'active', worker_id = ?2, started_at = ?3, updated_at = ?3
         WHERE id = ?1 AND state = 'waiting'",
        params![id, worker_id, now],
    )?;
    Ok(changed == 1)
}

/// Transitions an Active job held by `worker_id` to Completed. A worker whose
/// claim was reclaimed no longer matches.
pub fn mark_completed(
    conn: &Connection,
    id: &str,
    worker_id: &str,
    result_count: i64,
    strategy: Option<&str>,
    now: &str,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE jobs SET state = 'completed', result_count = ?3, strategy = ?4,
         completed_at = ?5, updated_at = ?5, worker_id = NULL, last_error = NULL
         WHERE id = ?1 AND state = 'active' AND worker_id = ?2",
        params![id, worker_id, result_count, strategy, now],
    )?;
    Ok(changed == 1)
}

/// Records a failed attempt and returns the job to Waiting until `available_at`.
pub fn mark_retry(
    conn: &Connection,
    id: &str,
    worker_id: &str,
    attempt: u32,
    error: &str,
    available_at: &str,
    now: &str,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE jobs SET state = 'waiting', attempt = ?3, last_error = ?4, available_at = ?5,
         updated_at = ?6, worker_id = NULL, started_at = NULL
         WHERE id = ?1 AND state = 'active' AND worker_id = ?2",
        params![id, worker_id, attempt, error, available_at, now],
    )?;
    Ok(changed == 1)
}

/// Records a failed attempt and moves the job to the terminal Failed state.
pub fn mark_failed(
    conn: &Connection,
    id: &str,
    worker_id: &str,
    attempt: u32,
    error: &str,
    now: &str,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE jobs SET state = 'failed', attempt = ?3, last_error = ?4, completed_at = ?5,
         updated_at = ?5, worker_id = NULL
         WHERE id = ?1 AND state = 'active' AND worker_id = ?2",
        params![id, worker_id, attempt, error, now],
    )?;
    Ok(changed == 1)
}

/// Returns an Active job to Waiting without touching its attempt count.
pub fn requeue(conn: &Connection, id: &str, now: &str) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE jobs SET state = 'waiting', available_at = ?2, updated_at = ?2,
         worker_id = NULL, started_at = NULL
         WHERE id = ?1 AND state = 'active'",
        params![id, now],
    )?;
    Ok(changed == 1)
}

/// Removes a Waiting job from the live queue by marking it superseded.
/// Active jobs are never superseded.
pub fn supersede(
    conn: &Connection,
    id: &str,
    superseded_by: Option<&str>,
    now: &str,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE jobs SET state = 'superseded', superseded_by = ?2, updated_at = ?3
         WHERE id = ?1 AND state = 'waiting'",
        params![id, superseded_by, now],
    )?;
    Ok(changed == 1)
}

/// Returns Active jobs started before `before`.
pub fn stale_active(conn: &Connection, before: &str) -> Result<Vec<JobRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM jobs WHERE state = 'active' AND started_at IS NOT NULL AND started_at < ?1
         ORDER BY seq ASC",
    )?;
    let rows = stmt
        .query_map(params![before], JobRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Counts jobs with the given state.
pub fn count_by_state(conn: &Connection, state: &str) -> Result<u64, DatabaseError> {
    let count: u64 = conn.query_row(
        "SELECT COUNT(*) FROM jobs WHERE state = ?1",
        params![state],
        |r| r.get(0),
    )?;
    Ok(count)
}

/// Returns every live (Waiting or Active) job ordered by term, then
/// survivor preference.
pub fn live_jobs(conn: &Connection) -> Result<Vec<JobRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM jobs WHERE state IN ('waiting', 'active')
         ORDER BY search_term COLLATE NOCASE ASC, priority ASC, seq ASC",
    )?;
    let rows = stmt
        .query_map([], JobRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Returns every distinct term that has ever been queued.
pub fn distinct_terms(conn: &Connection) -> Result<Vec<String>, DatabaseError> {
    let mut stmt = conn.prepare("SELECT DISTINCT search_term FROM jobs")?;
    let terms = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(terms)
}

/// Returns distinct terms whose jobs all ended Failed (or superseded), i.e.
/// terms with a Failed job and no live or Completed job.
pub fn failed_only_terms(conn: &Connection, limit: u64) -> Result<Vec<String>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT f.search_term FROM jobs f
         WHERE f.state = 'failed'
           AND NOT EXISTS (
               SELECT 1 FROM jobs o
               WHERE o.search_term = f.search_term
                 AND o.state IN ('waiting', 'active', 'completed')
           )
         GROUP BY f.search_term
         ORDER BY MAX(f.seq) DESC
         LIMIT ?1",
    )?;
    let terms = stmt
        .query_map(params![limit as i64], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(terms)
}

/// Queries jobs with filters, returning (rows, total_count).
pub fn query(conn: &Connection, filter: &JobFilter) -> Result<(Vec<JobRow>, u64), DatabaseError> {
    let mut conditions = Vec::new();
    let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(ref state) = filter.state {
        conditions.push(format!("state = ?{}", param_values.len() + 1));
        param_values.push(Box::new(state.clone()));
    }
    if let Some(ref term) = filter.search_term {
        conditions.push(format!("search_term = ?{}", param_values.len() + 1));
        param_values.push(Box::new(term.clone()));
    }
    if let Some(ref from_date) = filter.from_date {
        conditions.push(format!("created_at >= ?{}", param_values.len() + 1));
        param_values.push(Box::new(from_date.clone()));
    }
    if let Some(ref to_date) = filter.to_date {
        conditions.push(format!("created_at <= ?{}", param_values.len() + 1));
        param_values.push(Box::new(to_date.clone()));
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };

    let count_sql = format!("SELECT COUNT(*) FROM jobs {}", where_clause);
    let params_ref: Vec<&dyn rusqlite::types::ToSql> =
        param_values.iter().map(|p| p.as_ref()).collect();
    let total: u64 = conn.query_row(&count_sql, params_ref.as_slice(), |r| r.get(0))?;

    let limit = filter.limit.unwrap_or(100) as i64;
    let offset = filter.offset.unwrap_or(0) as i64;
    param_values.push(Box::new(limit));
    param_values.push(Box::new(offset));
    let query_sql = format!(
        "SELECT * FROM jobs {} ORDER BY seq DESC LIMIT ?{} OFFSET ?{}",
        where_clause,
        param_values.len() - 1,
        param_values.len()
    );

    let params_ref: Vec<&dyn rusqlite::types::ToSql> =
        param_values.iter().map(|p| p.as_ref()).collect();
    let mut stmt = conn.prepare(&query_sql)?;
    let rows: Vec<JobRow> = stmt
        .query_map(params_ref.as_slice(), JobRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok((rows, total))
}
