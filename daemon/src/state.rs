//! Long-running components of the harvester and their lifecycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, error, info, warn};
use parcelscout::config::resolve_database_path;
use parcelscout::generator::FeederSettings;
use parcelscout::queue::MaintenanceScheduler;
use parcelscout::retrieval::{BrowserlessCapturer, TokenSink};
use parcelscout::storage::ResultSink;
use parcelscout::token::TokenSettings;
use parcelscout::worker::{EngineFactory, JobResult, PoolSettings};
use parcelscout::{
    Config, ConfigError, Database, HealthMonitor, JobQueue, JobReport, ParcelScoutError,
    QueueFeeder, RecentErrors, RetrievalEngine, SearchTermGenerator, SqliteResultSink,
    TokenEncryptor, TokenManager, TokenStore, WorkerContext, WorkerError, WorkerPool,
};
use tokio::sync::broadcast;

pub struct Harvester {
    config: Config,
    queue: JobQueue,
    tokens: Arc<TokenManager>,
    sink: Arc<dyn ResultSink>,
    errors: Arc<RecentErrors>,
    health: HealthMonitor,

    pool: Option<WorkerPool>,

    feeder_shutdown: Arc<AtomicBool>,
    feeder: Option<JoinHandle<()>>,

    maintenance: Option<MaintenanceScheduler>,
    maintenance_handle: Option<JoinHandle<()>>,
    /// Manual maintenance trigger; also wakes the loop on shutdown.
    maintenance_tx: broadcast::Sender<()>,
}

impl Harvester {
    /// Opens the database and restores the token store. Nothing runs until
    /// [`Harvester::start`].
    pub fn open(config: Config) -> Result<Self, ParcelScoutError> {
        let db_path = resolve_database_path(&config).ok_or_else(|| ConfigError::Validation {
            message: "No database path: set PARCELSCOUT_DB or database_path".to_string(),
        })?;
        let db = Database::open(&db_path)?;

        let store = token_store(&config, &db);
        let capturer = BrowserlessCapturer::new(&config.browser, &config.source)?;
        let tokens = Arc::new(TokenManager::new(
            store,
            Arc::new(capturer),
            TokenSettings::from_config(&config),
        ));

        let queue = JobQueue::new(db.clone(), &config.queue);
        let errors = Arc::new(RecentErrors::new(config.health.recent_errors));
        let health = HealthMonitor::new(queue.clone(), Arc::clone(&tokens), Arc::clone(&errors));
        let (maintenance_tx, _) = broadcast::channel(4);

        Ok(Self {
            sink: Arc::new(SqliteResultSink::new(db)),
            config,
            queue,
            tokens,
            errors,
            health,
            pool: None,
            feeder_shutdown: Arc::new(AtomicBool::new(false)),
            feeder: None,
            maintenance: None,
            maintenance_handle: None,
            maintenance_tx,
        })
    }

    /// Starts token refresh, the worker pool, the queue feeder and queue
    /// maintenance, as enabled by configuration.
    pub fn start(&mut self) -> Result<(), ParcelScoutError> {
        if self.config.token.auto_refresh {
            self.tokens
                .start_auto_refresh(self.config.token.refresh_interval())?;
        }

        let factory = self.engine_factory();
        // Surface engine configuration errors here rather than once per worker.
        factory(0).map_err(|e| WorkerError::EngineSetup(e.to_string()))?;

        let ctx = WorkerContext {
            queue: self.queue.clone(),
            tokens: Arc::clone(&self.tokens),
            sink: Arc::clone(&self.sink),
            errors: Arc::clone(&self.errors),
        };
        self.pool = Some(WorkerPool::start(
            ctx,
            factory,
            PoolSettings::from_config(&self.config),
        )?);

        if self.config.generator.enabled {
            let generator = SearchTermGenerator::new(&self.config.generator.categories)?;
            let feeder = QueueFeeder::new(
                self.queue.clone(),
                generator,
                FeederSettings::from_config(&self.config.generator),
            );
            self.feeder_shutdown.store(false, Ordering::Release);
            let handle = feeder
                .run(Arc::clone(&self.feeder_shutdown))
                .map_err(|e| WorkerError::SpawnFailed(e.to_string()))?;
            self.feeder = Some(handle);
        } else {
            info!("Search term generator disabled");
        }

        if self.config.maintenance.enabled {
            let scheduler = MaintenanceScheduler::new(
                self.queue.clone(),
                self.config.maintenance.interval(),
                self.config.queue.stale_active(),
            );
            // Recover jobs left Active by a previous run before workers race for them.
            match scheduler.run_once() {
                Ok(report) => info!(
                    "Startup maintenance: {} job(s) reclaimed, {} duplicate(s) removed",
                    report.reclaimed, report.sweep.removed
                ),
                Err(e) => warn!("Startup maintenance failed: {}", e),
            }
            let handle = scheduler
                .start(self.maintenance_tx.subscribe())
                .map_err(|e| WorkerError::SpawnFailed(e.to_string()))?;
            self.maintenance_handle = Some(handle);
            self.maintenance = Some(scheduler);
        }

        Ok(())
    }

    fn engine_factory(&self) -> EngineFactory {
        let config = self.config.clone();
        let sink: Arc<dyn TokenSink> = self.tokens.store().clone();
        Arc::new(move |index| {
            debug!("Building retrieval engine for worker {}", index);
            Ok(RetrievalEngine::from_config(&config)?.with_token_sink(Arc::clone(&sink)))
        })
    }

    /// Logs every report the workers have produced since the last call.
    pub fn drain_reports(&self) -> usize {
        let Some(pool) = self.pool.as_ref() else {
            return 0;
        };
        let mut drained = 0;
        while let Some(report) = pool.try_recv_report() {
            log_report(&report);
            drained += 1;
        }
        drained
    }

    pub fn log_health(&self) {
        match self.health.snapshot() {
            Ok(report) => match serde_json::to_string(&report) {
                Ok(json) => info!("Health: {}", json),
                Err(e) => warn!("Failed to serialize health report: {}", e),
            },
            Err(e) => error!("Failed to build health report: {}", e),
        }
    }

    /// Stops every component and waits for in-flight jobs to finish.
    pub fn shutdown(mut self) {
        info!("Shutting down harvester...");

        self.feeder_shutdown.store(true, Ordering::Release);
        if let Some(pool) = self.pool.as_ref() {
            pool.shutdown();
        }
        if let Some(scheduler) = self.maintenance.take() {
            scheduler.stop();
            let _ = self.maintenance_tx.send(());
        }
        self.tokens.stop();

        if let Some(handle) = self.feeder.take() {
            if handle.join().is_err() {
                error!("Queue feeder thread panicked");
            }
        }
        if let Some(pool) = self.pool.take() {
            pool.wait();
        }
        if let Some(handle) = self.maintenance_handle.take() {
            if handle.join().is_err() {
                error!("Queue maintenance thread panicked");
            }
        }

        self.log_health();
        info!("Harvester stopped");
    }
}

fn token_store(config: &Config, db: &Database) -> Arc<TokenStore> {
    let mut store = TokenStore::new(config.token.staleness_ceiling());
    if config.token.persist {
        match TokenEncryptor::from_env() {
            Ok(encryptor) => store = store.with_persistence(db.clone(), encryptor),
            Err(e) => warn!("Token persistence disabled: {}", e),
        }
    }

    match store.restore(config.token.max_serve_age()) {
        Ok(Some(token)) => info!(
            "Restored bearer token {} ({}s old)",
            token.fingerprint(),
            token.age().as_secs()
        ),
        Ok(None) => debug!("No bearer token to restore"),
        Err(e) => warn!("Failed to restore bearer token: {}", e),
    }
    Arc::new(store)
}

fn log_report(report: &JobReport) {
    match &report.result {
        JobResult::Completed { .. } => debug!(
            "{} finished job {} in {}ms",
            report.worker_id, report.job_id, report.duration_ms
        ),
        JobResult::Retrying {
            attempt,
            delay_secs,
            error,
        } => warn!(
            "Job {} ('{}') attempt {} failed, retrying in {}s: {}",
            report.job_id, report.search_term, attempt, delay_secs, error
        ),
        JobResult::Failed { attempt, error } => error!(
            "Job {} ('{}') failed after {} attempt(s): {}",
            report.job_id, report.search_term, attempt, error
        ),
        JobResult::Lost { error } => error!(
            "Job {} ('{}') outcome was not recorded: {}",
            report.job_id, report.search_term, error
        ),
    }
}
