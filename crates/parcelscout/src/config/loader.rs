use std::path::{Path, PathBuf};

use crate::config::schema::Config;
use crate::error::ConfigError;

/// Environment variable naming the config file used by the daemon.
pub const CONFIG_PATH_ENV_VAR: &str = "PARCELSCOUT_CONFIG";

/// Environment variable overriding `database_path`.
pub const DATABASE_PATH_ENV_VAR: &str = "PARCELSCOUT_DB";

/// Highest accepted priority value; lower values are more urgent.
pub const MAX_PRIORITY: i64 = 100;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_yaml::from_str(content)?;
    validate_config(&config)?;
    Ok(config)
}

/// Resolves the database path: `PARCELSCOUT_DB`, then `database_path`, then
/// the default location under the home directory.
pub fn resolve_database_path(config: &Config) -> Option<PathBuf> {
    if let Ok(path) = std::env::var(DATABASE_PATH_ENV_VAR) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path.trim()));
        }
    }
    if let Some(path) = config.database_path.as_deref().filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(path));
    }
    crate::db::default_database_path()
}

pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    validate_url("source.data_api_url", &config.source.data_api_url)?;
    validate_url("source.search_page_url", &config.source.search_page_url)?;
    validate_url("browser.endpoint", &config.browser.endpoint)?;

    if config.source.page_size == 0 || config.source.max_pages == 0 {
        return Err(invalid("source.page_size and source.max_pages must be positive"));
    }
    if config.browser.row_cap == 0 {
        return Err(invalid("browser.row_cap must be positive"));
    }

    let queue = &config.queue;
    if queue.max_attempts == 0 {
        return Err(invalid("queue.max_attempts must be at least 1"));
    }
    if !(0..=MAX_PRIORITY).contains(&queue.default_priority) {
        return Err(invalid(format!(
            "queue.default_priority must be within 0..={}",
            MAX_PRIORITY
        )));
    }
    if queue.backoff_base_secs > queue.backoff_cap_secs {
        return Err(invalid("queue.backoff_base_secs exceeds queue.backoff_cap_secs"));
    }

    let workers = &config.workers;
    if workers.count == 0 {
        return Err(invalid("workers.count must be at least 1"));
    }
    if workers.pacing_min_ms > workers.pacing_max_ms {
        return Err(invalid("workers.pacing_min_ms exceeds workers.pacing_max_ms"));
    }
    if workers.fast_timeout_secs == 0 || workers.slow_timeout_secs == 0 {
        return Err(invalid("worker timeouts must be positive"));
    }
    // A running job may take the full fast plus slow budget before it reports.
    let job_budget = workers.fast_timeout_secs + workers.slow_timeout_secs;
    if queue.stale_active_secs <= job_budget {
        return Err(invalid(format!(
            "queue.stale_active_secs ({}) must exceed the job timeout of {}s \
             (workers.fast_timeout_secs + workers.slow_timeout_secs)",
            queue.stale_active_secs, job_budget
        )));
    }

    let token = &config.token;
    if token.staleness_ceiling_secs > token.max_serve_age_secs {
        return Err(invalid(
            "token.staleness_ceiling_secs exceeds token.max_serve_age_secs",
        ));
    }
    if token.auto_refresh && token.refresh_interval_secs == 0 {
        return Err(invalid("token.refresh_interval_secs must be positive"));
    }
    if token.auto_refresh && token.refresh_interval_secs >= token.staleness_ceiling_secs {
        return Err(invalid(format!(
            "token.refresh_interval_secs ({}) must be below token.staleness_ceiling_secs ({})",
            token.refresh_interval_secs, token.staleness_ceiling_secs
        )));
    }

    let generator = &config.generator;
    if generator.low_water >= generator.high_water {
        return Err(invalid(format!(
            "generator.low_water ({}) must be below generator.high_water ({})",
            generator.low_water, generator.high_water
        )));
    }
    if generator.batch_size == 0 {
        return Err(invalid("generator.batch_size must be positive"));
    }
    if !(0..=MAX_PRIORITY).contains(&generator.priority) {
        return Err(invalid(format!(
            "generator.priority must be within 0..={}",
            MAX_PRIORITY
        )));
    }
    if generator.enabled && generator.categories.is_empty() {
        return Err(invalid("generator is enabled but has no categories"));
    }

    let mut names = std::collections::HashSet::new();
    for category in &generator.categories {
        if !names.insert(category.name.as_str()) {
            return Err(ConfigError::InvalidCategory {
                name: category.name.clone(),
                reason: "Duplicate category name".to_string(),
            });
        }
        if category.weight == 0 {
            return Err(ConfigError::InvalidCategory {
                name: category.name.clone(),
                reason: "Weight must be positive".to_string(),
            });
        }
        if category.terms.iter().all(|t| t.trim().is_empty()) {
            return Err(ConfigError::InvalidCategory {
                name: category.name.clone(),
                reason: "Category has no terms".to_string(),
            });
        }
    }

    if config.maintenance.enabled && config.maintenance.interval_secs == 0 {
        return Err(invalid("maintenance.interval_secs must be positive"));
    }

    Ok(())
}

fn validate_url(field: &str, value: &str) -> Result<(), ConfigError> {
    let url = reqwest::Url::parse(value).map_err(|e| ConfigError::InvalidUrl {
        field: field.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https" | "ws" | "wss") {
        return Err(ConfigError::InvalidUrl {
            field: field.to_string(),
            reason: format!("Unsupported scheme '{}'", url.scheme()),
        });
    }
    Ok(())
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        message: message.into(),
    }
}
