use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Set to `json` for one JSON object per log line.
pub const LOG_FORMAT_ENV_VAR: &str = "PARCELSCOUT_LOG_FORMAT";

/// Installs the global subscriber. `RUST_LOG` selects levels (default
/// `info`); records emitted through the `log` facade are forwarded too.
pub fn init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var(LOG_FORMAT_ENV_VAR)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        tracing::subscriber::set_global_default(
            registry.with(fmt::layer().json().with_target(true)),
        )?;
    } else {
        tracing::subscriber::set_global_default(registry.with(fmt::layer().with_target(true)))?;
    }

    tracing_log::LogTracer::init()?;
    Ok(())
}
