use chrono::Utc;

use super::{JobOutcome, ResultSink, UpsertCounts};
use crate::db::{format_timestamp, outcome_repo, property_repo, Database};
use crate::error::StorageError;
use crate::retrieval::ResultRecord;

/// Stores results and outcomes in the local SQLite database.
#[derive(Clone)]
pub struct SqliteResultSink {
    db: Database,
}

impl SqliteResultSink {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl ResultSink for SqliteResultSink {
    fn upsert_results(&self, records: &[ResultRecord]) -> Result<UpsertCounts, StorageError> {
        if let Some(bad) = records.iter().find(|r| r.assessment_year <= 0) {
            return Err(StorageError::MissingPartitionKey {
                external_id: bad.external_id.clone(),
            });
        }

        let (inserted, updated) =
            property_repo::upsert_many(&self.db, records, &format_timestamp(Utc::now()))?;
        log::debug!(
            "Stored {} record(s): {} new, {} updated",
            records.len(),
            inserted,
            updated
        );
        Ok(UpsertCounts { inserted, updated })
    }

    fn record_job_outcome(&self, outcome: &JobOutcome) -> Result<(), StorageError> {
        outcome_repo::insert(
            &self.db,
            &outcome_repo::OutcomeRow {
                job_id: outcome.job_id.to_string(),
                search_term: outcome.search_term.clone(),
                status: outcome.status.as_str().to_string(),
                result_count: outcome
                    .result_count
                    .map(|c| i64::try_from(c).unwrap_or(i64::MAX)),
                strategy: outcome.strategy.map(|s| s.as_str().to_string()),
                error: outcome.error.clone(),
                duration_ms: Some(i64::try_from(outcome.duration.as_millis()).unwrap_or(i64::MAX)),
                recorded_at: format_timestamp(Utc::now()),
            },
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::JobId;
    use crate::retrieval::Strategy;
    use crate::storage::OutcomeStatus;
    use std::time::Duration;

    fn record(id: &str, year: i32) -> ResultRecord {
        ResultRecord {
            external_id: id.to_string(),
            assessment_year: year,
            owner_name: Some("TRUST OF SMITH".to_string()),
            property_type: None,
            street_address: None,
            city: None,
            postal_code: None,
            appraised_value: None,
            market_value: Some(100.0),
            geo_id: None,
            legal_description: None,
            search_term: "Trust".to_string(),
        }
    }

    #[test]
    fn test_upsert_counts() {
        let sink = SqliteResultSink::new(Database::open_in_memory().unwrap());
        let counts = sink.upsert_results(&[record("A", 2026), record("B", 2026)]).unwrap();
        assert_eq!(counts, UpsertCounts { inserted: 2, updated: 0 });
        let counts = sink.upsert_results(&[record("A", 2026)]).unwrap();
        assert_eq!(counts, UpsertCounts { inserted: 0, updated: 1 });
    }

    #[test]
    fn test_rejects_missing_year() {
        let sink = SqliteResultSink::new(Database::open_in_memory().unwrap());
        assert!(matches!(
            sink.upsert_results(&[record("A", 2026), record("B", 0)]),
            Err(StorageError::MissingPartitionKey { external_id }) if external_id == "B"
        ));
    }

    #[test]
    fn test_record_outcome() {
        let db = Database::open_in_memory().unwrap();
        let sink = SqliteResultSink::new(db.clone());
        sink.record_job_outcome(&JobOutcome {
            job_id: JobId::from("job-1"),
            search_term: "Trust".to_string(),
            status: OutcomeStatus::Completed,
            result_count: Some(0),
            strategy: Some(Strategy::Fast),
            error: None,
            duration: Duration::from_millis(1200),
        })
        .unwrap();

        let rows = outcome_repo::list_for_job(&db, "job-1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "completed");
        assert_eq!(rows[0].result_count, Some(0));
        assert_eq!(rows[0].strategy.as_deref(), Some("fast"));
        assert_eq!(rows[0].duration_ms, Some(1200));
    }
}
