//! Test harness for isolated queue and worker runs.
//!
//! The `TestHarness` owns a temporary directory holding a file-backed
//! database, so several threads can share one queue exactly as the daemon
//! does.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use parcelscout::config::QueueConfig;
use parcelscout::retrieval::{CredentialCapturer, DataApi, EngineSettings};
use parcelscout::storage::ResultSink;
use parcelscout::token::TokenSettings;
use parcelscout::{
    Database, DedupPlanner, JobQueue, RecentErrors, RetrievalEngine, TokenManager, TokenStore,
    WorkerContext,
};

pub struct TestHarness {
    temp_dir: TempDir,
    pub db_path: PathBuf,
    pub db: Database,
    pub queue: JobQueue,
}

impl TestHarness {
    /// Queue with immediate retries so failure paths run without waiting.
    pub fn new() -> Self {
        Self::with_queue_config(QueueConfig {
            backoff_base_secs: 0,
            backoff_cap_secs: 0,
            ..QueueConfig::default()
        })
    }

    pub fn with_queue_config(config: QueueConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("data").join("parcelscout.db");
        let db = Database::open(&db_path).expect("Failed to open test database");
        let queue = JobQueue::new(db.clone(), &config);

        Self {
            temp_dir,
            db_path,
            db,
            queue,
        }
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn planner(&self) -> DedupPlanner {
        DedupPlanner::new(self.queue.clone())
    }

    pub fn token_manager(&self, capturer: Arc<dyn CredentialCapturer>) -> Arc<TokenManager> {
        let settings = TokenSettings {
            capture_timeout: Duration::from_secs(5),
            ..TokenSettings::default()
        };
        Arc::new(TokenManager::new(
            Arc::new(TokenStore::new(settings.staleness_ceiling)),
            capturer,
            settings,
        ))
    }

    pub fn worker_context(
        &self,
        tokens: Arc<TokenManager>,
        sink: Arc<dyn ResultSink>,
    ) -> WorkerContext {
        WorkerContext {
            queue: self.queue.clone(),
            tokens,
            sink,
            errors: Arc::new(RecentErrors::new(20)),
        }
    }
}

/// Engine over fakes with short timeouts and a fixed assessment year.
pub fn engine(api: Arc<dyn DataApi>, browser: Arc<dyn CredentialCapturer>) -> RetrievalEngine {
    RetrievalEngine::new(
        api,
        browser,
        EngineSettings {
            fast_timeout: Duration::from_secs(2),
            slow_timeout: Duration::from_secs(2),
            fallback_on_error: true,
            default_year: Some(2024),
        },
    )
}
