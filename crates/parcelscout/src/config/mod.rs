pub mod loader;
pub mod schema;

pub use loader::{
    load_config, load_config_from_str, resolve_database_path, validate_config,
    CONFIG_PATH_ENV_VAR, DATABASE_PATH_ENV_VAR, MAX_PRIORITY,
};
pub use schema::{
    BrowserConfig, CategoryConfig, Config, GeneratorConfig, HealthConfig, MaintenanceConfig,
    QueueConfig, SelectorConfig, SourceConfig, TokenConfig, WorkersConfig,
};
