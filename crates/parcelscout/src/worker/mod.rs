pub mod executor;
pub mod pacing;
pub mod pool;

pub use executor::{decide_retry, execute, AttemptError, JobReport, JobResult, WorkerContext};
pub use pacing::Pacing;
pub use pool::{EngineFactory, PoolSettings, WorkerPool};
