//! Bearer token repository: the `bearer_tokens` table.
//!
//! Values are stored encrypted; this layer only sees ciphertext.

use rusqlite::{params, OptionalExtension};

use super::{Database, DatabaseError};

/// A raw bearer token row from the database.
#[derive(Debug, Clone)]
pub struct BearerTokenRow {
    pub name: String,
    pub ciphertext: String,
    pub origin: String,
    pub fetched_at: String,
    pub updated_at: String,
}

impl BearerTokenRow {
    /// Returns the age of the stored token, or `None` if `fetched_at` is unparseable.
    pub fn age(&self) -> Option<chrono::Duration> {
        let fetched = chrono::DateTime::parse_from_rfc3339(&self.fetched_at).ok()?;
        Some(chrono::Utc::now().signed_duration_since(fetched))
    }
}

/// Inserts or replaces the token stored under `row.name`.
pub fn upsert(db: &Database, row: &BearerTokenRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO bearer_tokens (name, ciphertext, origin, fetched_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(name) DO UPDATE SET
               ciphertext = ?2,
               origin = ?3,
               fetched_at = ?4,
               updated_at = ?5",
            params![
                row.name,
                row.ciphertext,
                row.origin,
                row.fetched_at,
                row.updated_at,
            ],
        )?;
        Ok(())
    })
}

pub fn find(db: &Database, name: &str) -> Result<Option<BearerTokenRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT name, ciphertext, origin, fetched_at, updated_at
                 FROM bearer_tokens WHERE name = ?1",
                params![name],
                |row| {
                    Ok(BearerTokenRow {
                        name: row.get(0)?,
                        ciphertext: row.get(1)?,
                        origin: row.get(2)?,
                        fetched_at: row.get(3)?,
                        updated_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    })
}

pub fn delete(db: &Database, name: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute("DELETE FROM bearer_tokens WHERE name = ?1", params![name])?;
        Ok(())
    })
}
