use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::WorkersConfig;

const SLICE: Duration = Duration::from_millis(50);

/// Random delay between consecutive requests from one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    pub min: Duration,
    pub max: Duration,
}

impl Pacing {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
        }
    }

    pub fn from_config(config: &WorkersConfig) -> Self {
        Self::new(
            Duration::from_millis(config.pacing_min_ms),
            Duration::from_millis(config.pacing_max_ms),
        )
    }

    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// A uniformly random delay in `[min, max]`.
    pub fn next_delay(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let min = self.min.as_millis() as u64;
        let max = self.max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

/// Sleeps for `duration` unless `shutdown` is raised first. Returns false if
/// interrupted.
pub fn sleep_unless_shutdown(duration: Duration, shutdown: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if shutdown.load(Ordering::Acquire) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(SLICE.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_delay_within_bounds() {
        let pacing = Pacing::new(Duration::from_millis(100), Duration::from_millis(300));
        for _ in 0..100 {
            let d = pacing.next_delay();
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(300));
        }
        assert_eq!(Pacing::none().next_delay(), Duration::ZERO);
    }

    #[test]
    fn test_inverted_range_collapses_to_min() {
        let pacing = Pacing::new(Duration::from_millis(500), Duration::from_millis(100));
        assert_eq!(pacing.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_sleep_interrupted_by_shutdown() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            flag.store(true, Ordering::Release);
        });

        let started = Instant::now();
        assert!(!sleep_unless_shutdown(Duration::from_secs(30), &shutdown));
        assert!(started.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_sleep_completes() {
        let shutdown = AtomicBool::new(false);
        assert!(sleep_unless_shutdown(Duration::from_millis(10), &shutdown));
    }
}
