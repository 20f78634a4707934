//! Dual-strategy retrieval.
//!
//! With a token the engine calls the data API directly (up to a thousand rows
//! per page). Without one, or when the API refuses the token, it drives the
//! search page in a headless browser, which yields a capped number of rows
//! and, as a side effect, a fresh bearer token.

pub mod browser;
pub mod data_api;
pub mod error;
pub mod record;

use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use serde::Serialize;
use tracing::{info, instrument, warn};

pub use browser::{BrowserCapture, BrowserlessCapturer, CredentialCapturer};
pub use data_api::{ApiResults, DataApi, HttpDataApi};
pub use error::RetrievalError;
pub use record::{normalize_rows, ResultRecord};

use crate::config::Config;

/// Which path produced a fetch result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Data API with an existing token.
    Fast,
    /// Browser only.
    Slow,
    /// Browser captured a token, then the data API returned the full set.
    SlowThenFast,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Slow => "slow",
            Self::SlowThenFast => "slow_then_fast",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives bearer tokens captured as a side effect of browser searches.
pub trait TokenSink: Send + Sync {
    fn accept_captured(&self, token: SecretString);
}

/// Result of one `fetch`. Zero records is a successful outcome.
#[derive(Debug)]
pub struct FetchOutcome {
    pub records: Vec<ResultRecord>,
    pub strategy: Strategy,
    /// Raw rows dropped during normalisation.
    pub skipped: usize,
    /// More rows existed than were returned.
    pub truncated: bool,
    /// Why the engine left the fast path, if it did.
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub fast_timeout: Duration,
    pub slow_timeout: Duration,
    pub fallback_on_error: bool,
    /// Year used for rows without one; the current year when `None`.
    pub default_year: Option<i32>,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            fast_timeout: config.workers.fast_timeout(),
            slow_timeout: config.workers.slow_timeout(),
            fallback_on_error: config.source.fallback_on_error,
            default_year: None,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            fast_timeout: Duration::from_secs(30),
            slow_timeout: Duration::from_secs(90),
            fallback_on_error: true,
            default_year: None,
        }
    }
}

pub struct RetrievalEngine {
    data_api: Arc<dyn DataApi>,
    capturer: Arc<dyn CredentialCapturer>,
    token_sink: Option<Arc<dyn TokenSink>>,
    settings: EngineSettings,
}

impl RetrievalEngine {
    pub fn new(
        data_api: Arc<dyn DataApi>,
        capturer: Arc<dyn CredentialCapturer>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            data_api,
            capturer,
            token_sink: None,
            settings,
        }
    }

    /// Builds an engine with its own HTTP clients and browser capturer.
    pub fn from_config(config: &Config) -> Result<Self, RetrievalError> {
        let data_api = HttpDataApi::new(&config.source)?;
        let capturer = BrowserlessCapturer::new(&config.browser, &config.source)?;
        Ok(Self::new(
            Arc::new(data_api),
            Arc::new(capturer),
            EngineSettings::from_config(config),
        ))
    }

    pub fn with_token_sink(mut self, sink: Arc<dyn TokenSink>) -> Self {
        self.token_sink = Some(sink);
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Upper bound for one job. Either order of strategies runs at most one
    /// data-API call and one browser pass.
    pub fn job_timeout(&self) -> Duration {
        self.settings.fast_timeout + self.settings.slow_timeout
    }

    #[instrument(name = "fetch", skip(self, token), fields(has_token = token.is_some()))]
    pub async fn fetch(
        &self,
        term: &str,
        token: Option<&SecretString>,
    ) -> Result<FetchOutcome, RetrievalError> {
        let term = term.trim();
        if term.is_empty() {
            return Err(RetrievalError::InvalidInput(
                "search term is empty".to_string(),
            ));
        }

        match token {
            Some(token) => self.fetch_with_token(term, token).await,
            None => self.fetch_without_token(term).await,
        }
    }

    async fn fetch_with_token(
        &self,
        term: &str,
        token: &SecretString,
    ) -> Result<FetchOutcome, RetrievalError> {
        let err = match self.fast(term, token).await {
            Ok(outcome) => return Ok(outcome),
            Err(err) => err,
        };

        if err.is_auth_expired() {
            warn!(term, error = %err, "Bearer token rejected, falling back to browser");
        } else if self.settings.fallback_on_error {
            warn!(term, error = %err, kind = err.kind(), "Fast path failed, falling back to browser");
        } else {
            return Err(err);
        }

        let mut capture = self.slow(term).await?;
        if let Some(fresh) = capture.bearer_token.take() {
            self.publish(fresh);
        }
        let mut outcome = self.outcome_from_capture(term, &capture, Strategy::Slow);
        outcome.fallback_reason = Some(err.to_string());
        Ok(outcome)
    }

    async fn fetch_without_token(&self, term: &str) -> Result<FetchOutcome, RetrievalError> {
        let mut capture = self.slow(term).await?;
        let slow_outcome = self.outcome_from_capture(term, &capture, Strategy::Slow);

        let Some(captured) = capture.bearer_token.take() else {
            return Ok(slow_outcome);
        };

        let retry = self.fast(term, &captured).await;
        self.publish(captured);

        match retry {
            Ok(mut outcome) => {
                outcome.strategy = Strategy::SlowThenFast;
                Ok(outcome)
            }
            Err(err) => {
                warn!(
                    term,
                    error = %err,
                    rows = slow_outcome.records.len(),
                    "Fast retry with captured token failed, keeping browser rows"
                );
                Ok(slow_outcome)
            }
        }
    }

    async fn fast(&self, term: &str, token: &SecretString) -> Result<FetchOutcome, RetrievalError> {
        let results = tokio::time::timeout(self.settings.fast_timeout, self.data_api.search(term, token))
            .await
            .map_err(|_| RetrievalError::Timeout {
                strategy: Strategy::Fast.as_str(),
                after: self.settings.fast_timeout,
            })??;

        let normalized = normalize_rows(&results.rows, term, self.default_year());
        info!(
            term,
            records = normalized.records.len(),
            pages = results.pages,
            "Fast path fetch complete"
        );
        Ok(FetchOutcome {
            records: normalized.records,
            strategy: Strategy::Fast,
            skipped: normalized.skipped,
            truncated: results.truncated,
            fallback_reason: None,
        })
    }

    async fn slow(&self, term: &str) -> Result<BrowserCapture, RetrievalError> {
        tokio::time::timeout(self.settings.slow_timeout, self.capturer.capture(term))
            .await
            .map_err(|_| RetrievalError::Timeout {
                strategy: Strategy::Slow.as_str(),
                after: self.settings.slow_timeout,
            })?
    }

    fn outcome_from_capture(
        &self,
        term: &str,
        capture: &BrowserCapture,
        strategy: Strategy,
    ) -> FetchOutcome {
        let normalized = normalize_rows(&capture.rows, term, self.default_year());
        FetchOutcome {
            records: normalized.records,
            strategy,
            skipped: normalized.skipped,
            truncated: capture.truncated,
            fallback_reason: None,
        }
    }

    fn publish(&self, token: SecretString) {
        if let Some(ref sink) = self.token_sink {
            sink.accept_captured(token);
        }
    }

    fn default_year(&self) -> i32 {
        self.settings
            .default_year
            .unwrap_or_else(record::current_assessment_year)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use secrecy::ExposeSecret;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedApi {
        responses: Mutex<VecDeque<Result<ApiResults, RetrievalError>>>,
        calls: AtomicUsize,
        delay: Option<Duration>,
    }

    impl ScriptedApi {
        fn new(responses: Vec<Result<ApiResults, RetrievalError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicUsize::new(0),
                delay: None,
            })
        }
    }

    #[async_trait]
    impl DataApi for ScriptedApi {
        async fn search(&self, _term: &str, _bearer: &SecretString) -> Result<ApiResults, RetrievalError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ApiResults::default()))
        }
    }

    struct ScriptedBrowser {
        rows: Vec<Value>,
        token: Option<&'static str>,
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CredentialCapturer for ScriptedBrowser {
        async fn capture(&self, _term: &str) -> Result<BrowserCapture, RetrievalError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(RetrievalError::Browser("grid never rendered".to_string()));
            }
            Ok(BrowserCapture {
                rows: self.rows.clone(),
                bearer_token: self.token.map(SecretString::from),
                truncated: false,
            })
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        tokens: Mutex<Vec<String>>,
    }

    impl TokenSink for RecordingSink {
        fn accept_captured(&self, token: SecretString) {
            self.tokens
                .lock()
                .unwrap()
                .push(token.expose_secret().to_string());
        }
    }

    fn browser(rows: Vec<Value>, token: Option<&'static str>) -> Arc<ScriptedBrowser> {
        Arc::new(ScriptedBrowser {
            rows,
            token,
            fail: false,
            calls: AtomicUsize::new(0),
        })
    }

    fn api_rows(n: usize) -> ApiResults {
        ApiResults {
            rows: (0..n).map(|i| json!({"propertyId": i, "year": 2025})).collect(),
            pages: 1,
            truncated: false,
        }
    }

    fn token() -> SecretString {
        SecretString::from("tok-1")
    }

    #[tokio::test]
    async fn test_zero_matches_is_success_on_fast_path() {
        let api = ScriptedApi::new(vec![Ok(ApiResults::default())]);
        let slow = browser(vec![], None);
        let engine = RetrievalEngine::new(api.clone(), slow.clone(), EngineSettings::default());

        let outcome = engine.fetch("Zzyzx123", Some(&token())).await.unwrap();
        assert!(outcome.records.is_empty());
        assert_eq!(outcome.strategy, Strategy::Fast);
        assert_eq!(slow.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_auth_failure_degrades_to_browser() {
        let api = ScriptedApi::new(vec![Err(RetrievalError::AuthExpired { status: 401 })]);
        let slow = browser(vec![json!({"Property ID": "R1"})], Some("fresh"));
        let sink = Arc::new(RecordingSink::default());
        let engine = RetrievalEngine::new(api.clone(), slow.clone(), EngineSettings::default())
            .with_token_sink(sink.clone());

        let outcome = engine.fetch("Trust", Some(&token())).await.unwrap();
        assert_eq!(outcome.strategy, Strategy::Slow);
        assert_eq!(outcome.records.len(), 1);
        assert!(outcome.fallback_reason.is_some());
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*sink.tokens.lock().unwrap(), vec!["fresh".to_string()]);
    }

    #[tokio::test]
    async fn test_browser_failure_after_auth_failure_is_returned() {
        let api = ScriptedApi::new(vec![Err(RetrievalError::AuthExpired { status: 403 })]);
        let slow = Arc::new(ScriptedBrowser {
            rows: vec![],
            token: None,
            fail: true,
            calls: AtomicUsize::new(0),
        });
        let engine = RetrievalEngine::new(api, slow, EngineSettings::default());

        let err = engine.fetch("Trust", Some(&token())).await.unwrap_err();
        assert!(matches!(err, RetrievalError::Browser(_)));
    }

    #[tokio::test]
    async fn test_no_token_captures_then_retries_fast() {
        let api = ScriptedApi::new(vec![Ok(api_rows(40))]);
        let slow = browser(vec![json!({"Property ID": "R1"})], Some("captured"));
        let sink = Arc::new(RecordingSink::default());
        let engine = RetrievalEngine::new(api.clone(), slow, EngineSettings::default())
            .with_token_sink(sink.clone());

        let outcome = engine.fetch("Garcia", None).await.unwrap();
        assert_eq!(outcome.strategy, Strategy::SlowThenFast);
        assert_eq!(outcome.records.len(), 40);
        assert_eq!(*sink.tokens.lock().unwrap(), vec!["captured".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_fast_retry_keeps_browser_rows() {
        let api = ScriptedApi::new(vec![Err(RetrievalError::Server {
            status: 503,
            body: String::new(),
        })]);
        let slow = browser(
            vec![json!({"Property ID": "R1"}), json!({"Property ID": "R2"})],
            Some("captured"),
        );
        let engine = RetrievalEngine::new(api, slow, EngineSettings::default());

        let outcome = engine.fetch("Garcia", None).await.unwrap();
        assert_eq!(outcome.strategy, Strategy::Slow);
        assert_eq!(outcome.records.len(), 2);
    }

    #[tokio::test]
    async fn test_no_token_and_no_capture_is_slow() {
        let api = ScriptedApi::new(vec![]);
        let slow = browser(vec![], None);
        let engine = RetrievalEngine::new(api.clone(), slow, EngineSettings::default());

        let outcome = engine.fetch("Nguyen", None).await.unwrap();
        assert_eq!(outcome.strategy, Strategy::Slow);
        assert!(outcome.records.is_empty());
        assert_eq!(api.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fast_failure_propagates_without_fallback() {
        let api = ScriptedApi::new(vec![Err(RetrievalError::Server {
            status: 500,
            body: "boom".to_string(),
        })]);
        let slow = browser(vec![], None);
        let settings = EngineSettings {
            fallback_on_error: false,
            ..EngineSettings::default()
        };
        let engine = RetrievalEngine::new(api, slow.clone(), settings);

        let err = engine.fetch("Lee", Some(&token())).await.unwrap_err();
        assert!(matches!(err, RetrievalError::Server { status: 500, .. }));
        assert_eq!(slow.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_term_is_invalid_input() {
        let api = ScriptedApi::new(vec![]);
        let slow = browser(vec![], None);
        let engine = RetrievalEngine::new(api.clone(), slow.clone(), EngineSettings::default());

        let err = engine.fetch("   ", Some(&token())).await.unwrap_err();
        assert!(matches!(err, RetrievalError::InvalidInput(_)));
        assert!(!err.is_retryable());
        assert_eq!(api.calls.load(Ordering::SeqCst), 0);
        assert_eq!(slow.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fast_timeout_falls_back() {
        let api = Arc::new(ScriptedApi {
            responses: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            delay: Some(Duration::from_millis(500)),
        });
        let slow = browser(vec![json!({"Property ID": "R9"})], None);
        let settings = EngineSettings {
            fast_timeout: Duration::from_millis(20),
            ..EngineSettings::default()
        };
        let engine = RetrievalEngine::new(api, slow, settings);

        let outcome = engine.fetch("Patel", Some(&token())).await.unwrap();
        assert_eq!(outcome.strategy, Strategy::Slow);
        assert!(outcome
            .fallback_reason
            .as_deref()
            .is_some_and(|r| r.contains("timed out")));
    }

    #[test]
    fn test_job_timeout_budget() {
        let engine = RetrievalEngine::new(
            ScriptedApi::new(vec![]),
            browser(vec![], None),
            EngineSettings {
                fast_timeout: Duration::from_secs(30),
                slow_timeout: Duration::from_secs(90),
                ..EngineSettings::default()
            },
        );
        assert_eq!(engine.job_timeout(), Duration::from_secs(120));
    }
}
