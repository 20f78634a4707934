mod logging;
mod state;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info};
use parcelscout::config::CONFIG_PATH_ENV_VAR;

use state::Harvester;

const TICK: Duration = Duration::from_millis(250);

/// Config path from the first argument, else `PARCELSCOUT_CONFIG`.
fn config_path() -> Option<PathBuf> {
    std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os(CONFIG_PATH_ENV_VAR).map(PathBuf::from))
}

fn main() -> ExitCode {
    if let Err(e) = logging::init() {
        eprintln!("Failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

    info!("Starting parcelscout v{}", env!("CARGO_PKG_VERSION"));

    let Some(path) = config_path() else {
        error!(
            "No configuration file: pass a path or set {}",
            CONFIG_PATH_ENV_VAR
        );
        return ExitCode::FAILURE;
    };
    let config = match parcelscout::load_config(&path) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    info!("Configuration loaded from {}", path.display());

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received Ctrl-C, stopping...");
        flag.store(true, Ordering::SeqCst);
    }) {
        error!("Failed to install Ctrl-C handler: {}", e);
        return ExitCode::FAILURE;
    }

    let health_interval = config.health.log_interval();
    let mut harvester = match Harvester::open(config) {
        Ok(harvester) => harvester,
        Err(e) => {
            error!("Failed to initialize: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = harvester.start() {
        error!("Failed to start: {}", e);
        harvester.shutdown();
        return ExitCode::FAILURE;
    }
    info!("Harvester running");

    let mut last_health = Instant::now();
    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(TICK);
        harvester.drain_reports();
        if last_health.elapsed() >= health_interval {
            harvester.log_health();
            last_health = Instant::now();
        }
    }

    harvester.shutdown();
    ExitCode::SUCCESS
}
