use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: String,
    pub source: SourceConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub token: TokenConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub health: HealthConfig,
    /// Overridden by `PARCELSCOUT_DB`; defaults to `~/.parcelscout/data/parcelscout.db`.
    #[serde(default)]
    pub database_path: Option<String>,
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_true() -> bool {
    true
}

/// The external property-record source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Structured search endpoint used by the fast path.
    pub data_api_url: String,
    /// Public search page driven by the browser path.
    pub search_page_url: String,
    /// Substring identifying outbound data-API requests during token capture.
    /// Defaults to the host of `data_api_url`.
    #[serde(default)]
    pub api_host_pattern: Option<String>,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Degrade to the browser path on non-auth fast-path failures too.
    #[serde(default = "default_true")]
    pub fallback_on_error: bool,
}

fn default_page_size() -> u32 {
    1000
}

fn default_max_pages() -> u32 {
    10
}

fn default_request_timeout() -> u64 {
    30
}

impl SourceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Returns the configured capture pattern or the data API host.
    pub fn capture_pattern(&self) -> String {
        if let Some(pattern) = self.api_host_pattern.as_deref().filter(|p| !p.is_empty()) {
            return pattern.to_string();
        }
        reqwest::Url::parse(&self.data_api_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| self.data_api_url.clone())
    }
}

/// Browserless-compatible headless browser endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    #[serde(default = "default_browser_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_file: Option<String>,
    #[serde(default)]
    pub api_key_env_var: Option<String>,
    #[serde(default = "default_browser_timeout")]
    pub timeout_secs: u64,
    /// Maximum rows harvested from the result grid.
    #[serde(default = "default_row_cap")]
    pub row_cap: u32,
    #[serde(default)]
    pub selectors: SelectorConfig,
}

fn default_browser_endpoint() -> String {
    "http://localhost:3000".to_string()
}

fn default_browser_timeout() -> u64 {
    90
}

fn default_row_cap() -> u32 {
    20
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            endpoint: default_browser_endpoint(),
            api_key: None,
            api_key_file: None,
            api_key_env_var: None,
            timeout_secs: default_browser_timeout(),
            row_cap: default_row_cap(),
            selectors: SelectorConfig::default(),
        }
    }
}

/// DOM selectors for the search page. The page markup changes without
/// notice, so none of these are hard-coded in the script.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub search_input: String,
    pub submit: String,
    pub result_row: String,
    pub header_cell: String,
    pub no_results: String,
    pub next_page: String,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            search_input: "#search-input".to_string(),
            submit: "button[type=submit]".to_string(),
            result_row: "table.results tbody tr".to_string(),
            header_cell: "table.results thead th".to_string(),
            no_results: ".no-results".to_string(),
            next_page: ".pagination .next:not(.disabled)".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Lower is more urgent.
    pub default_priority: i64,
    pub max_attempts: u32,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
    /// Active jobs older than this are considered abandoned.
    pub stale_active_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_priority: 5,
            max_attempts: 3,
            backoff_base_secs: 30,
            backoff_cap_secs: 900,
            stale_active_secs: 600,
            poll_interval_ms: 1000,
        }
    }
}

impl QueueConfig {
    pub fn stale_active(&self) -> Duration {
        Duration::from_secs(self.stale_active_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    #[serde(default = "default_worker_count")]
    pub count: usize,
    #[serde(default = "default_fast_timeout")]
    pub fast_timeout_secs: u64,
    #[serde(default = "default_slow_timeout")]
    pub slow_timeout_secs: u64,
    #[serde(default = "default_pacing_min")]
    pub pacing_min_ms: u64,
    #[serde(default = "default_pacing_max")]
    pub pacing_max_ms: u64,
    /// Capacity of the job report channel.
    #[serde(default = "default_report_capacity")]
    pub report_capacity: usize,
}

fn default_worker_count() -> usize {
    num_cpus::get().clamp(1, 4)
}

fn default_fast_timeout() -> u64 {
    30
}

fn default_slow_timeout() -> u64 {
    90
}

fn default_pacing_min() -> u64 {
    1500
}

fn default_pacing_max() -> u64 {
    4000
}

fn default_report_capacity() -> usize {
    256
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            fast_timeout_secs: default_fast_timeout(),
            slow_timeout_secs: default_slow_timeout(),
            pacing_min_ms: default_pacing_min(),
            pacing_max_ms: default_pacing_max(),
            report_capacity: default_report_capacity(),
        }
    }
}

impl WorkersConfig {
    pub fn fast_timeout(&self) -> Duration {
        Duration::from_secs(self.fast_timeout_secs)
    }

    pub fn slow_timeout(&self) -> Duration {
        Duration::from_secs(self.slow_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    pub auto_refresh: bool,
    pub refresh_interval_secs: u64,
    /// Tokens older than this are reported stale. The source's real TTL is
    /// unpublished (observed around five minutes).
    pub staleness_ceiling_secs: u64,
    /// Tokens older than this are no longer served at all.
    pub max_serve_age_secs: u64,
    /// Search term used when a refresh drives the browser.
    pub probe_term: String,
    /// Persist captured tokens (requires `PARCELSCOUT_TOKEN_KEY`).
    pub persist: bool,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            auto_refresh: true,
            refresh_interval_secs: 240,
            staleness_ceiling_secs: 300,
            max_serve_age_secs: 1800,
            probe_term: "Smith".to_string(),
            persist: true,
        }
    }
}

impl TokenConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn staleness_ceiling(&self) -> Duration {
        Duration::from_secs(self.staleness_ceiling_secs)
    }

    pub fn max_serve_age(&self) -> Duration {
        Duration::from_secs(self.max_serve_age_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_low_water")]
    pub low_water: u64,
    #[serde(default = "default_high_water")]
    pub high_water: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_generator_priority")]
    pub priority: i64,
    #[serde(default = "default_generator_poll")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_generator_backoff")]
    pub backoff_interval_secs: u64,
    #[serde(default = "default_coverage_refresh")]
    pub coverage_refresh_secs: u64,
    #[serde(default = "crate::generator::default_categories")]
    pub categories: Vec<CategoryConfig>,
}

fn default_low_water() -> u64 {
    50
}

fn default_high_water() -> u64 {
    200
}

fn default_batch_size() -> usize {
    25
}

fn default_generator_priority() -> i64 {
    10
}

fn default_generator_poll() -> u64 {
    15
}

fn default_generator_backoff() -> u64 {
    60
}

fn default_coverage_refresh() -> u64 {
    600
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            low_water: default_low_water(),
            high_water: default_high_water(),
            batch_size: default_batch_size(),
            priority: default_generator_priority(),
            poll_interval_secs: default_generator_poll(),
            backoff_interval_secs: default_generator_backoff(),
            coverage_refresh_secs: default_coverage_refresh(),
            categories: crate::generator::default_categories(),
        }
    }
}

/// A weighted group of search terms. Categories are sampled in proportion
/// to their weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryConfig {
    pub name: String,
    pub weight: u32,
    pub terms: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
        }
    }
}

impl MaintenanceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// How many recent job errors the health surface keeps.
    pub recent_errors: usize,
    /// How often the daemon logs a health snapshot.
    pub log_interval_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            recent_errors: 50,
            log_interval_secs: 60,
        }
    }
}

impl HealthConfig {
    pub fn log_interval(&self) -> Duration {
        Duration::from_secs(self.log_interval_secs.max(1))
    }
}
