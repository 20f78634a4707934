//! Versioned schema migrations.
//!
//! Applied versions are recorded in `_migrations`. Each pending migration
//! runs in its own transaction together with its version row, so a crash
//! mid-upgrade leaves the schema at the last complete version.

use rusqlite::{params, Connection};

use super::error::DatabaseError;

/// `(version, name, sql)`, in ascending version order.
const MIGRATIONS: &[(u32, &str, &str)] = &[
    (1, "create_jobs", include_str!("sql/001_create_jobs.sql")),
    (2, "create_properties", include_str!("sql/002_create_properties.sql")),
    (3, "create_job_outcomes", include_str!("sql/003_create_job_outcomes.sql")),
    (4, "create_bearer_tokens", include_str!("sql/004_create_bearer_tokens.sql")),
];

/// Highest version this build knows how to apply.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |(version, _, _)| *version)
}

/// Highest applied version, 0 for a fresh database.
pub fn schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |r| r.get(0),
    )?)
}

/// Brings the schema up to [`latest_version`].
pub fn run_all(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );",
    )?;

    let current = schema_version(conn)?;
    if current > latest_version() {
        return Err(DatabaseError::Migration {
            version: current,
            reason: format!(
                "database schema is newer than this build (knows up to v{})",
                latest_version()
            ),
        });
    }

    for &(version, name, sql) in MIGRATIONS.iter().filter(|(v, _, _)| *v > current) {
        log::info!("Applying schema migration v{} ({})", version, name);
        let apply = || -> rusqlite::Result<()> {
            conn.execute_batch("BEGIN IMMEDIATE;")?;
            let result = conn.execute_batch(sql).and_then(|_| {
                conn.execute(
                    "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
                    params![version, name],
                )
                .map(|_| ())
            });
            match result {
                Ok(()) => conn.execute_batch("COMMIT;"),
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK;");
                    Err(e)
                }
            }
        };
        apply().map_err(|e| DatabaseError::Migration {
            version,
            reason: e.to_string(),
        })?;
    }

    Ok(())
}
