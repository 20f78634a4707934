//! Periodic queue upkeep: stale-job reclamation and the duplicate sweep.
//!
//! Runs on its own thread and supports a manual trigger via broadcast channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;

use super::{JobQueue, QueueError};
use crate::dedup::{DedupPlanner, SweepReport};

#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceReport {
    pub reclaimed: usize,
    pub sweep: SweepReport,
}

pub struct MaintenanceScheduler {
    queue: JobQueue,
    planner: DedupPlanner,
    interval: Duration,
    stale_threshold: Duration,
    shutdown: Arc<AtomicBool>,
}

impl MaintenanceScheduler {
    pub fn new(queue: JobQueue, interval: Duration, stale_threshold: Duration) -> Self {
        Self {
            planner: DedupPlanner::new(queue.clone()),
            queue,
            interval,
            stale_threshold,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// One maintenance pass.
    pub fn run_once(&self) -> Result<MaintenanceReport, QueueError> {
        let reclaimed = self.queue.reclaim_stale(self.stale_threshold)?;
        let sweep = self.planner.sweep()?;
        Ok(MaintenanceReport { reclaimed, sweep })
    }

    /// Start the maintenance loop in a background thread.
    /// Accepts a trigger receiver for manual runs.
    pub fn start(
        &self,
        mut trigger_rx: broadcast::Receiver<()>,
    ) -> std::io::Result<JoinHandle<()>> {
        let queue = self.queue.clone();
        let planner = self.planner.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.interval;
        let stale_threshold = self.stale_threshold;

        std::thread::Builder::new()
            .name("queue-maintenance".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        log::error!("Queue maintenance could not start its runtime: {}", e);
                        return;
                    }
                };

                rt.block_on(async {
                    let mut interval_timer = tokio::time::interval(interval);
                    interval_timer.tick().await; // skip immediate first tick

                    loop {
                        if shutdown.load(Ordering::Acquire) {
                            break;
                        }

                        tokio::select! {
                            _ = interval_timer.tick() => {},
                            Ok(()) = trigger_rx.recv() => {
                                log::info!("Manual queue maintenance triggered");
                            },
                        }

                        if shutdown.load(Ordering::Acquire) {
                            break;
                        }

                        match queue.reclaim_stale(stale_threshold) {
                            Ok(n) if n > 0 => log::info!("Maintenance reclaimed {} job(s)", n),
                            Err(e) => log::error!("Stale job reclamation failed: {}", e),
                            _ => {}
                        }
                        match planner.sweep() {
                            Ok(report) if report.failed > 0 => log::warn!(
                                "Duplicate sweep left {} job(s) in place: {}",
                                report.failed,
                                report.errors.join("; ")
                            ),
                            Err(e) => log::error!("Duplicate sweep failed: {}", e),
                            _ => {}
                        }
                    }
                });
            })
    }

    /// Signals the scheduler to stop.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}
