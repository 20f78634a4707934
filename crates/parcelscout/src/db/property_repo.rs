//! Property repository: idempotent upserts keyed by (external_id, assessment_year).

use rusqlite::{params, OptionalExtension};

use super::{Database, DatabaseError};
use crate::retrieval::ResultRecord;

/// A stored property row with its bookkeeping timestamps.
#[derive(Debug, Clone)]
pub struct PropertyRow {
    pub record: ResultRecord,
    pub first_seen_at: String,
    pub last_seen_at: String,
}

/// Upserts a batch in one transaction. Returns `(inserted, updated)`.
///
/// An existing row keeps its `first_seen_at`; every other column takes the
/// newer value.
pub fn upsert_many(
    db: &Database,
    records: &[ResultRecord],
    now: &str,
) -> Result<(u64, u64), DatabaseError> {
    if records.is_empty() {
        return Ok((0, 0));
    }

    db.with_transaction(|tx| {
        let mut exists_stmt = tx.prepare(
            "SELECT EXISTS(SELECT 1 FROM properties WHERE external_id = ?1 AND assessment_year = ?2)",
        )?;
        let mut upsert_stmt = tx.prepare(
            "INSERT INTO properties (external_id, assessment_year, owner_name, property_type,
             street_address, city, postal_code, appraised_value, market_value, geo_id,
             legal_description, search_term, first_seen_at, last_seen_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)
             ON CONFLICT(external_id, assessment_year) DO UPDATE SET
                owner_name = excluded.owner_name,
                property_type = excluded.property_type,
                street_address = excluded.street_address,
                city = excluded.city,
                postal_code = excluded.postal_code,
                appraised_value = excluded.appraised_value,
                market_value = excluded.market_value,
                geo_id = excluded.geo_id,
                legal_description = excluded.legal_description,
                search_term = excluded.search_term,
                last_seen_at = excluded.last_seen_at",
        )?;

        let mut inserted = 0;
        let mut updated = 0;
        for r in records {
            let existed: bool =
                exists_stmt.query_row(params![r.external_id, r.assessment_year], |row| row.get(0))?;
            upsert_stmt.execute(params![
                r.external_id,
                r.assessment_year,
                r.owner_name,
                r.property_type,
                r.street_address,
                r.city,
                r.postal_code,
                r.appraised_value,
                r.market_value,
                r.geo_id,
                r.legal_description,
                r.search_term,
                now,
            ])?;
            if existed {
                updated += 1;
            } else {
                inserted += 1;
            }
        }
        Ok((inserted, updated))
    })
}

pub fn find(
    db: &Database,
    external_id: &str,
    assessment_year: i32,
) -> Result<Option<PropertyRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT external_id, assessment_year, owner_name, property_type, street_address,
                 city, postal_code, appraised_value, market_value, geo_id, legal_description,
                 search_term, first_seen_at, last_seen_at
                 FROM properties WHERE external_id = ?1 AND assessment_year = ?2",
                params![external_id, assessment_year],
                |row| {
                    Ok(PropertyRow {
                        record: ResultRecord {
                            external_id: row.get(0)?,
                            assessment_year: row.get(1)?,
                            owner_name: row.get(2)?,
                            property_type: row.get(3)?,
                            street_address: row.get(4)?,
                            city: row.get(5)?,
                            postal_code: row.get(6)?,
                            appraised_value: row.get(7)?,
                            market_value: row.get(8)?,
                            geo_id: row.get(9)?,
                            legal_description: row.get(10)?,
                            search_term: row.get(11)?,
                        },
                        first_seen_at: row.get(12)?,
                        last_seen_at: row.get(13)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    })
}

pub fn count(db: &Database) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM properties", [], |r| r.get(0))?))
}
