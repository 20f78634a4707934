use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, error, info, warn};

use super::executor::{execute, JobReport, WorkerContext};
use super::pacing::{sleep_unless_shutdown, Pacing};
use crate::config::Config;
use crate::error::WorkerError;
use crate::retrieval::{RetrievalEngine, RetrievalError};

/// Builds a worker's private retrieval engine. Called once per worker
/// thread with the worker index.
pub type EngineFactory =
    Arc<dyn Fn(usize) -> Result<RetrievalEngine, RetrievalError> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub concurrency: usize,
    /// Sleep between dequeue attempts while the queue is empty.
    pub poll_interval: Duration,
    pub pacing: Pacing,
    pub report_capacity: usize,
}

impl PoolSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            concurrency: config.workers.count,
            poll_interval: config.queue.poll_interval(),
            pacing: Pacing::from_config(&config.workers),
            report_capacity: config.workers.report_capacity,
        }
    }
}

pub struct WorkerPool {
    report_receiver: Receiver<JobReport>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Starts `settings.concurrency` worker threads pulling from the queue.
    pub fn start(
        ctx: WorkerContext,
        factory: EngineFactory,
        settings: PoolSettings,
    ) -> Result<Self, WorkerError> {
        if settings.concurrency == 0 {
            return Err(WorkerError::SpawnFailed(
                "worker count must be at least 1".to_string(),
            ));
        }

        let (report_sender, report_receiver) = bounded::<JobReport>(settings.report_capacity.max(1));
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(settings.concurrency);

        for index in 0..settings.concurrency {
            let worker = Worker {
                id: format!("worker-{}", index),
                index,
                ctx: ctx.clone(),
                factory: Arc::clone(&factory),
                reports: report_sender.clone(),
                shutdown: Arc::clone(&shutdown),
                poll_interval: settings.poll_interval,
                pacing: settings.pacing,
            };

            let spawned = thread::Builder::new()
                .name(worker.id.clone())
                .spawn(move || worker.run());
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    shutdown.store(true, Ordering::Release);
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(WorkerError::SpawnFailed(e.to_string()));
                }
            }
        }

        info!("Started {} workers", settings.concurrency);

        Ok(Self {
            report_receiver,
            workers,
            shutdown,
        })
    }

    pub fn try_recv_report(&self) -> Option<JobReport> {
        self.report_receiver.try_recv().ok()
    }

    pub fn recv_report_timeout(&self, timeout: Duration) -> Option<JobReport> {
        self.report_receiver.recv_timeout(timeout).ok()
    }

    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.store(true, Ordering::Release);
    }

    /// Waits for every worker to finish its current job and exit.
    pub fn wait(self) {
        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }

        info!("All workers have stopped");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

struct Worker {
    id: String,
    index: usize,
    ctx: WorkerContext,
    factory: EngineFactory,
    reports: Sender<JobReport>,
    shutdown: Arc<AtomicBool>,
    poll_interval: Duration,
    pacing: Pacing,
}

impl Worker {
    fn run(self) {
        debug!("{} started", self.id);

        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                error!("{} could not build its runtime: {}", self.id, e);
                return;
            }
        };
        // Owned by this worker; its browser session and HTTP clients go
        // away when the worker exits.
        let engine = match (self.factory)(self.index) {
            Ok(engine) => engine,
            Err(e) => {
                error!("{} could not build its retrieval engine: {}", self.id, e);
                return;
            }
        };

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                debug!("{} received shutdown signal", self.id);
                break;
            }

            let job = match self.ctx.queue.dequeue(&self.id) {
                Ok(Some(job)) => job,
                Ok(None) => {
                    if !sleep_unless_shutdown(self.poll_interval, &self.shutdown) {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    error!("{} failed to dequeue: {}", self.id, e);
                    if !sleep_unless_shutdown(self.poll_interval, &self.shutdown) {
                        break;
                    }
                    continue;
                }
            };

            debug!("{} processing job {} ('{}')", self.id, job.id, job.search_term);
            let report = rt.block_on(execute(&self.ctx, &engine, &self.id, job));

            match self.reports.try_send(report) {
                Ok(()) => {}
                Err(TrySendError::Full(report)) => {
                    debug!("Report channel full, dropping report for job {}", report.job_id)
                }
                Err(TrySendError::Disconnected(_)) => {
                    warn!("{} report channel closed", self.id);
                }
            }

            if !sleep_unless_shutdown(self.pacing.next_delay(), &self.shutdown) {
                break;
            }
        }

        debug!("{} stopped", self.id);
    }
}
