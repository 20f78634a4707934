//! The shared bearer-token cell.
//!
//! One writer replaces the whole token; readers clone an `Arc` snapshot, so a
//! reader never sees a half-updated token and never waits on a refresh.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

use super::TokenError;
use crate::db::{self, token_repo, Database};
use crate::retrieval::TokenSink;
use crate::sanitize::token_fingerprint;
use crate::secrets::TokenEncryptor;

/// Row name under which the data-API token is persisted.
const TOKEN_NAME: &str = "data_api";

/// How a token entered the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenOrigin {
    /// Side effect of a job's browser search.
    Captured,
    /// Scheduled or manual refresh by the token manager.
    Refreshed,
    /// Loaded from the database at startup.
    Restored,
    /// Supplied directly by an operator or a test.
    Seeded,
}

impl TokenOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Captured => "captured",
            Self::Refreshed => "refreshed",
            Self::Restored => "restored",
            Self::Seeded => "seeded",
        }
    }
}

/// A bearer credential for the data API. Immutable once stored; a newer
/// token replaces it.
#[derive(Debug)]
pub struct Token {
    pub value: SecretString,
    pub fetched_at: DateTime<Utc>,
    /// Soft expiry; the source does not publish a TTL.
    pub expires_approx: DateTime<Utc>,
    pub origin: TokenOrigin,
    /// How many tokens the store had accepted before this one.
    pub refresh_count: u64,
}

impl Token {
    pub fn age(&self) -> Duration {
        Utc::now()
            .signed_duration_since(self.fetched_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    pub fn fingerprint(&self) -> String {
        token_fingerprint(self.value.expose_secret())
    }
}

struct Persistence {
    db: Database,
    encryptor: TokenEncryptor,
}

pub struct TokenStore {
    current: RwLock<Option<Arc<Token>>>,
    accepted: AtomicU64,
    soft_ttl: Duration,
    persistence: Option<Persistence>,
}

impl TokenStore {
    /// `soft_ttl` sets each token's `expires_approx`.
    pub fn new(soft_ttl: Duration) -> Self {
        Self {
            current: RwLock::new(None),
            accepted: AtomicU64::new(0),
            soft_ttl,
            persistence: None,
        }
    }

    /// Writes every accepted token through to `bearer_tokens`, encrypted.
    pub fn with_persistence(mut self, db: Database, encryptor: TokenEncryptor) -> Self {
        self.persistence = Some(Persistence { db, encryptor });
        self
    }

    /// Returns the latest token, whatever its age.
    pub fn get(&self) -> Option<Arc<Token>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace(&self, value: SecretString, origin: TokenOrigin) -> Arc<Token> {
        self.replace_at(value, origin, Utc::now())
    }

    /// Stores a token observed at `fetched_at`.
    pub fn replace_at(
        &self,
        value: SecretString,
        origin: TokenOrigin,
        fetched_at: DateTime<Utc>,
    ) -> Arc<Token> {
        let soft_ttl = chrono::Duration::from_std(self.soft_ttl)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let token = Arc::new(Token {
            value,
            fetched_at,
            expires_approx: fetched_at + soft_ttl,
            origin,
            refresh_count: self.accepted.fetch_add(1, Ordering::AcqRel),
        });

        if origin != TokenOrigin::Restored {
            if let Err(e) = self.persist(&token) {
                log::warn!("Failed to persist bearer token: {}", e);
            }
        }

        *self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&token));

        log::info!(
            "Bearer token {} stored (origin: {})",
            token.fingerprint(),
            origin.as_str()
        );
        token
    }

    /// Loads the persisted token if it is younger than `max_age`.
    pub fn restore(&self, max_age: Duration) -> Result<Option<Arc<Token>>, TokenError> {
        let Some(ref persistence) = self.persistence else {
            return Ok(None);
        };
        let Some(row) = token_repo::find(&persistence.db, TOKEN_NAME)? else {
            return Ok(None);
        };

        let too_old = row
            .age()
            .and_then(|age| age.to_std().ok())
            .map_or(true, |age| age > max_age);
        if too_old {
            log::info!("Persisted bearer token is too old to restore");
            return Ok(None);
        }

        let value = persistence.encryptor.decrypt(&row.ciphertext)?;
        log::debug!("Restoring bearer token captured as '{}'", row.origin);
        Ok(Some(self.replace_at(
            SecretString::from(value),
            TokenOrigin::Restored,
            db::parse_timestamp(&row.fetched_at),
        )))
    }

    fn persist(&self, token: &Token) -> Result<(), TokenError> {
        let Some(ref persistence) = self.persistence else {
            return Ok(());
        };
        let now = db::format_timestamp(Utc::now());
        token_repo::upsert(
            &persistence.db,
            &token_repo::BearerTokenRow {
                name: TOKEN_NAME.to_string(),
                ciphertext: persistence.encryptor.encrypt(token.value.expose_secret())?,
                origin: token.origin.as_str().to_string(),
                fetched_at: db::format_timestamp(token.fetched_at),
                updated_at: now,
            },
        )?;
        Ok(())
    }
}

impl TokenSink for TokenStore {
    fn accept_captured(&self, token: SecretString) {
        self.replace(token, TokenOrigin::Captured);
    }
}
