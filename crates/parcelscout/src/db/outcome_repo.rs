//! Job outcome log: append-only rows in `job_outcomes`.

use rusqlite::params;

use super::{Database, DatabaseError};

/// One recorded outcome of a job attempt.
#[derive(Debug, Clone)]
pub struct OutcomeRow {
    pub job_id: String,
    pub search_term: String,
    pub status: String,
    pub result_count: Option<i64>,
    pub strategy: Option<String>,
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
    pub recorded_at: String,
}

pub fn insert(db: &Database, row: &OutcomeRow) -> Result<i64, DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO job_outcomes (job_id, search_term, status, result_count, strategy, error,
             duration_ms, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                row.job_id,
                row.search_term,
                row.status,
                row.result_count,
                row.strategy,
                row.error,
                row.duration_ms,
                row.recorded_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    })
}

/// Returns every outcome recorded for a job, oldest first.
pub fn list_for_job(db: &Database, job_id: &str) -> Result<Vec<OutcomeRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT job_id, search_term, status, result_count, strategy, error, duration_ms, recorded_at
             FROM job_outcomes WHERE job_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![job_id], |row| {
                Ok(OutcomeRow {
                    job_id: row.get(0)?,
                    search_term: row.get(1)?,
                    status: row.get(2)?,
                    result_count: row.get(3)?,
                    strategy: row.get(4)?,
                    error: row.get(5)?,
                    duration_ms: row.get(6)?,
                    recorded_at: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Counts outcomes per status since `since` (inclusive).
pub fn count_by_status_since(
    db: &Database,
    since: &str,
) -> Result<Vec<(String, u64)>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM job_outcomes WHERE recorded_at >= ?1
             GROUP BY status ORDER BY status",
        )?;
        let rows = stmt
            .query_map(params![since], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}
