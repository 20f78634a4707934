//! Backpressure loop that keeps the queue fed with generated terms.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::SearchTermGenerator;
use crate::config::GeneratorConfig;
use crate::dedup::DedupPlanner;
use crate::queue::{Disposition, EnqueueOptions, JobQueue, QueueError};
use crate::worker::pacing::sleep_unless_shutdown;

/// Draw rounds per tick before giving up on a batch mostly filtered away.
const MAX_DRAW_ROUNDS: usize = 8;

/// What one feeder step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeederAction {
    /// Live jobs at or above the high-water mark.
    BackedOff,
    /// Between the marks, or nothing new survived planning.
    Idle,
    Enqueued(usize),
    /// The generator has no undrawn terms left.
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct FeederSettings {
    pub low_water: u64,
    pub high_water: u64,
    pub batch_size: usize,
    pub priority: i64,
    pub poll_interval: Duration,
    pub backoff_interval: Duration,
    pub coverage_refresh: Duration,
}

impl FeederSettings {
    pub fn from_config(config: &GeneratorConfig) -> Self {
        Self {
            low_water: config.low_water,
            high_water: config.high_water,
            batch_size: config.batch_size,
            priority: config.priority,
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            backoff_interval: Duration::from_secs(config.backoff_interval_secs),
            coverage_refresh: Duration::from_secs(config.coverage_refresh_secs),
        }
    }
}

pub struct QueueFeeder {
    queue: JobQueue,
    planner: DedupPlanner,
    generator: SearchTermGenerator,
    settings: FeederSettings,
    last_refresh: Option<Instant>,
}

impl QueueFeeder {
    pub fn new(queue: JobQueue, generator: SearchTermGenerator, settings: FeederSettings) -> Self {
        Self {
            planner: DedupPlanner::new(queue.clone()),
            queue,
            generator,
            settings,
            last_refresh: None,
        }
    }

    pub fn generator(&self) -> &SearchTermGenerator {
        &self.generator
    }

    /// One backpressure step.
    pub fn tick(&mut self) -> Result<FeederAction, QueueError> {
        self.refresh_coverage_if_due()?;

        let live = self.queue.counts()?.live();
        if live >= self.settings.high_water {
            log::debug!("Queue holds {} live job(s), feeder backing off", live);
            return Ok(FeederAction::BackedOff);
        }
        if live >= self.settings.low_water {
            return Ok(FeederAction::Idle);
        }

        let target = self
            .settings
            .batch_size
            .min((self.settings.high_water - live) as usize);
        let mut enqueued = 0;
        for _ in 0..MAX_DRAW_ROUNDS {
            if enqueued >= target {
                break;
            }
            let batch = self.generator.next_batch(target - enqueued);
            if batch.is_empty() {
                break;
            }
            for term in self.planner.plan(&batch, self.settings.priority)? {
                let handle =
                    self.queue
                        .enqueue(&term, self.settings.priority, EnqueueOptions::default())?;
                if handle.disposition != Disposition::ExistingKept {
                    enqueued += 1;
                }
            }
        }

        if enqueued > 0 {
            log::info!(
                "Feeder enqueued {} generated term(s) ({} live before)",
                enqueued,
                live
            );
            Ok(FeederAction::Enqueued(enqueued))
        } else if self.generator.is_exhausted() {
            Ok(FeederAction::Exhausted)
        } else {
            Ok(FeederAction::Idle)
        }
    }

    fn refresh_coverage_if_due(&mut self) -> Result<(), QueueError> {
        let due = self
            .last_refresh
            .map_or(true, |at| at.elapsed() >= self.settings.coverage_refresh);
        if due {
            let known = self.queue.known_terms()?;
            log::debug!("Refreshing generator coverage from {} known term(s)", known.len());
            self.generator.mark_emitted(&known);
            self.last_refresh = Some(Instant::now());
        }
        Ok(())
    }

    /// Runs the feeder on its own thread until `shutdown` is raised.
    pub fn run(mut self, shutdown: Arc<AtomicBool>) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("queue-feeder".to_string())
            .spawn(move || {
                let mut exhausted_logged = false;
                loop {
                    let pause = match self.tick() {
                        Ok(FeederAction::BackedOff) => self.settings.backoff_interval,
                        Ok(FeederAction::Exhausted) => {
                            if !exhausted_logged {
                                log::warn!("Search term generator exhausted every category");
                                exhausted_logged = true;
                            }
                            self.settings.backoff_interval
                        }
                        Ok(_) => self.settings.poll_interval,
                        Err(e) => {
                            log::error!("Queue feeder step failed: {}", e);
                            self.settings.backoff_interval
                        }
                    };
                    if !sleep_unless_shutdown(pause, &shutdown) {
                        break;
                    }
                }
                log::info!("Queue feeder stopped");
            })
    }
}
