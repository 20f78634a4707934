//! Bearer token lifecycle: a shared store plus a manager that renews the
//! token on its own cadence through the browser capture.

pub mod manager;
pub mod store;

use thiserror::Error;

pub use manager::{TokenHealth, TokenManager, TokenSettings};
pub use store::{Token, TokenOrigin, TokenStore};

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Token capture failed: {0}")]
    Capture(#[from] crate::retrieval::RetrievalError),

    #[error("Browser search finished without observing a bearer token")]
    NoTokenCaptured,

    #[error("Token persistence failed: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Token encryption failed: {0}")]
    Secret(#[from] crate::secrets::SecretError),

    #[error("Failed to start token refresh: {0}")]
    Runtime(String),
}
