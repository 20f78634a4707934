//! Token renewal and health.
//!
//! Refresh failures are recorded, never propagated to readers: `current()`
//! keeps serving the last good token until it passes the max serve age.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, instrument, warn};

use super::{Token, TokenError, TokenOrigin, TokenStore};
use crate::config::Config;
use crate::retrieval::{CredentialCapturer, RetrievalError};

#[derive(Debug, Clone)]
pub struct TokenSettings {
    /// Age beyond which `health()` reports the token stale.
    pub staleness_ceiling: Duration,
    /// Age beyond which `current()` stops serving the token.
    pub max_serve_age: Duration,
    pub probe_term: String,
    pub capture_timeout: Duration,
}

impl TokenSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            staleness_ceiling: config.token.staleness_ceiling(),
            max_serve_age: config.token.max_serve_age(),
            probe_term: config.token.probe_term.clone(),
            capture_timeout: config.workers.slow_timeout(),
        }
    }
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            staleness_ceiling: Duration::from_secs(300),
            max_serve_age: Duration::from_secs(1800),
            probe_term: "Smith".to_string(),
            capture_timeout: Duration::from_secs(90),
        }
    }
}

/// Token manager health, as exposed to operational tooling.
#[derive(Debug, Clone, Serialize)]
pub struct TokenHealth {
    pub has_token: bool,
    pub last_refresh_age_secs: Option<u64>,
    /// Failed refreshes over refresh attempts; 0 before the first attempt.
    pub failure_rate: f64,
    pub stale: bool,
    pub refresh_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u64,
    pub last_error: Option<String>,
    pub fingerprint: Option<String>,
}

#[derive(Debug, Default)]
struct RefreshStats {
    attempts: u64,
    successes: u64,
    failures: u64,
    consecutive_failures: u64,
    last_error: Option<String>,
}

pub struct TokenManager {
    store: Arc<TokenStore>,
    capturer: Arc<dyn CredentialCapturer>,
    settings: TokenSettings,
    stats: Mutex<RefreshStats>,
    refresh_lock: tokio::sync::Mutex<()>,
    shutdown: Arc<AtomicBool>,
    trigger_tx: broadcast::Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TokenManager {
    pub fn new(
        store: Arc<TokenStore>,
        capturer: Arc<dyn CredentialCapturer>,
        settings: TokenSettings,
    ) -> Self {
        let (trigger_tx, _) = broadcast::channel(4);
        Self {
            store,
            capturer,
            settings,
            stats: Mutex::new(RefreshStats::default()),
            refresh_lock: tokio::sync::Mutex::new(()),
            shutdown: Arc::new(AtomicBool::new(false)),
            trigger_tx,
            handle: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    /// Returns the latest token unless it is older than the max serve age.
    pub fn current(&self) -> Option<Arc<Token>> {
        let token = self.store.get()?;
        if token.age() > self.settings.max_serve_age {
            log::debug!(
                "Bearer token {} is {}s old, past the serve limit",
                token.fingerprint(),
                token.age().as_secs()
            );
            return None;
        }
        Some(token)
    }

    /// Captures a new token through the browser. One refresh runs at a time;
    /// concurrent callers wait for it and then refresh again.
    #[instrument(name = "token_refresh", skip(self), fields(probe = %self.settings.probe_term))]
    pub async fn refresh_now(&self) -> Result<Arc<Token>, TokenError> {
        let _guard = self.refresh_lock.lock().await;
        self.with_stats(|s| s.attempts += 1);

        let capture = tokio::time::timeout(
            self.settings.capture_timeout,
            self.capturer.capture(&self.settings.probe_term),
        )
        .await
        .map_err(|_| RetrievalError::Timeout {
            strategy: "slow",
            after: self.settings.capture_timeout,
        })
        .and_then(|r| r);

        let result = match capture {
            Ok(capture) => capture.bearer_token.ok_or(TokenError::NoTokenCaptured),
            Err(e) => Err(TokenError::Capture(e)),
        };

        match result {
            Ok(value) => {
                let token = self.store.replace(value, TokenOrigin::Refreshed);
                self.with_stats(|s| {
                    s.successes += 1;
                    s.consecutive_failures = 0;
                });
                info!(token = %token.fingerprint(), "Bearer token refreshed");
                Ok(token)
            }
            Err(e) => {
                let message = e.to_string();
                let consecutive = self.with_stats(|s| {
                    s.failures += 1;
                    s.consecutive_failures += 1;
                    s.last_error = Some(message.clone());
                    s.consecutive_failures
                });
                warn!(error = %message, consecutive, "Bearer token refresh failed");
                Err(e)
            }
        }
    }

    pub fn health(&self) -> TokenHealth {
        let token = self.store.get();
        let age = token.as_ref().map(|t| t.age());
        let servable = age.is_some_and(|a| a <= self.settings.max_serve_age);
        let stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);

        TokenHealth {
            has_token: servable,
            last_refresh_age_secs: age.map(|a| a.as_secs()),
            failure_rate: if stats.attempts == 0 {
                0.0
            } else {
                stats.failures as f64 / stats.attempts as f64
            },
            stale: age.is_some_and(|a| a > self.settings.staleness_ceiling),
            refresh_count: stats.successes,
            failure_count: stats.failures,
            consecutive_failures: stats.consecutive_failures,
            last_error: stats.last_error.clone(),
            fingerprint: token.as_ref().map(|t| t.fingerprint()),
        }
    }

    /// Starts renewing the token every `interval` on a background thread.
    /// The first refresh runs immediately when no token is held.
    pub fn start_auto_refresh(self: &Arc<Self>, interval: Duration) -> Result<(), TokenError> {
        let mut handle_slot = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if handle_slot.is_some() {
            return Ok(());
        }
        self.shutdown.store(false, Ordering::Release);

        let manager = Arc::clone(self);
        let shutdown = Arc::clone(&self.shutdown);
        let mut trigger_rx = self.trigger_tx.subscribe();

        let handle = std::thread::Builder::new()
            .name("token-refresh".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        log::error!("Token refresh runtime failed to start: {}", e);
                        return;
                    }
                };

                rt.block_on(async {
                    let mut timer = tokio::time::interval(interval);
                    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                    if manager.current().is_some() {
                        timer.tick().await; // token in hand, wait a full interval
                    }

                    loop {
                        if shutdown.load(Ordering::Acquire) {
                            break;
                        }

                        tokio::select! {
                            _ = timer.tick() => {},
                            Ok(()) = trigger_rx.recv() => {
                                log::info!("Manual token refresh triggered");
                            },
                        }

                        if shutdown.load(Ordering::Acquire) {
                            break;
                        }

                        // Failures are already recorded in the stats.
                        let _ = manager.refresh_now().await;
                    }
                });
                log::info!("Token refresh loop stopped");
            })
            .map_err(|e| TokenError::Runtime(e.to_string()))?;

        *handle_slot = Some(handle);
        log::info!("Token auto refresh started (every {}s)", interval.as_secs());
        Ok(())
    }

    /// Requests an out-of-band refresh from the auto-refresh loop.
    pub fn trigger(&self) {
        let _ = self.trigger_tx.send(());
    }

    /// Stops the auto-refresh loop and waits for it to exit.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.trigger();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("Token refresh thread panicked");
            }
        }
    }

    fn with_stats<T>(&self, f: impl FnOnce(&mut RefreshStats) -> T) -> T {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::BrowserCapture;
    use async_trait::async_trait;
    use chrono::Utc;
    use secrecy::{ExposeSecret, SecretString};
    use std::sync::atomic::AtomicUsize;

    /// Hands out `tok-N` tokens, or fails every call when `fail` is set.
    struct CountingCapturer {
        calls: AtomicUsize,
        fail: AtomicBool,
    }

    impl CountingCapturer {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: AtomicBool::new(fail),
            })
        }
    }

    #[async_trait]
    impl CredentialCapturer for CountingCapturer {
        async fn capture(&self, _term: &str) -> Result<BrowserCapture, RetrievalError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail.load(Ordering::SeqCst) {
                return Err(RetrievalError::Browser("navigation timeout".to_string()));
            }
            Ok(BrowserCapture {
                rows: vec![],
                bearer_token: Some(SecretString::from(format!("tok-{}", n))),
                truncated: false,
            })
        }
    }

    fn manager(capturer: Arc<CountingCapturer>) -> TokenManager {
        TokenManager::new(
            Arc::new(TokenStore::new(Duration::from_secs(300))),
            capturer,
            TokenSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_refresh_stores_token() {
        let manager = manager(CountingCapturer::new(false));
        assert!(manager.current().is_none());

        let token = manager.refresh_now().await.unwrap();
        assert_eq!(token.value.expose_secret(), "tok-1");
        assert_eq!(token.origin, TokenOrigin::Refreshed);

        let health = manager.health();
        assert!(health.has_token);
        assert!(!health.stale);
        assert_eq!(health.refresh_count, 1);
        assert_eq!(health.failure_rate, 0.0);
    }

    #[tokio::test]
    async fn test_failed_refreshes_keep_last_good_token() {
        let manager = manager(CountingCapturer::new(true));
        manager.store().replace_at(
            SecretString::from("ninety-seconds-old"),
            TokenOrigin::Seeded,
            Utc::now() - chrono::Duration::seconds(90),
        );

        assert!(manager.refresh_now().await.is_err());
        assert!(manager.refresh_now().await.is_err());

        let current = manager.current().unwrap();
        assert_eq!(current.value.expose_secret(), "ninety-seconds-old");

        let health = manager.health();
        assert_eq!(health.failure_rate, 1.0);
        assert_eq!(health.failure_count, 2);
        assert_eq!(health.consecutive_failures, 2);
        assert!(health.has_token);
        assert!(!health.stale);
        assert!(health
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("navigation timeout")));
    }

    #[tokio::test]
    async fn test_capture_without_token_is_failure() {
        struct Tokenless;

        #[async_trait]
        impl CredentialCapturer for Tokenless {
            async fn capture(&self, _term: &str) -> Result<BrowserCapture, RetrievalError> {
                Ok(BrowserCapture::default())
            }
        }

        let manager = TokenManager::new(
            Arc::new(TokenStore::new(Duration::from_secs(300))),
            Arc::new(Tokenless),
            TokenSettings::default(),
        );
        assert!(matches!(
            manager.refresh_now().await,
            Err(TokenError::NoTokenCaptured)
        ));
        assert_eq!(manager.health().failure_count, 1);
    }

    #[test]
    fn test_stale_and_unservable_tokens() {
        let manager = manager(CountingCapturer::new(false));

        manager.store().replace_at(
            SecretString::from("ten-minutes"),
            TokenOrigin::Seeded,
            Utc::now() - chrono::Duration::minutes(10),
        );
        assert!(manager.current().is_some());
        let health = manager.health();
        assert!(health.stale);
        assert!(health.has_token);

        manager.store().replace_at(
            SecretString::from("an-hour"),
            TokenOrigin::Seeded,
            Utc::now() - chrono::Duration::hours(1),
        );
        assert!(manager.current().is_none());
        assert!(!manager.health().has_token);
    }

    #[test]
    fn test_health_without_attempts() {
        let manager = manager(CountingCapturer::new(false));
        let health = manager.health();
        assert!(!health.has_token);
        assert_eq!(health.failure_rate, 0.0);
        assert!(health.last_refresh_age_secs.is_none());
    }

    #[test]
    fn test_auto_refresh_runs_immediately_and_stops() {
        let capturer = CountingCapturer::new(false);
        let manager = Arc::new(manager(capturer.clone()));

        manager.start_auto_refresh(Duration::from_secs(3600)).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while manager.current().is_none() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(manager.current().is_some());

        manager.trigger();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while capturer.calls.load(Ordering::SeqCst) < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(capturer.calls.load(Ordering::SeqCst), 2);

        manager.stop();
    }
}
