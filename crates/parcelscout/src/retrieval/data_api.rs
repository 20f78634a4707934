//! Fast path: the source's structured search API.

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::debug;

use super::RetrievalError;
use crate::config::SourceConfig;
use crate::sanitize::{redact_url, truncate_body};

const ERROR_BODY_CHARS: usize = 200;
const RESULT_KEYS: &[&str] = &["results", "data", "items", "Results", "Data", "Items"];
const TOTAL_KEYS: &[&str] = &["totalCount", "total", "total_count", "TotalCount"];

/// Raw rows gathered across all pages of one search.
#[derive(Debug, Default)]
pub struct ApiResults {
    pub rows: Vec<Value>,
    pub pages: u32,
    /// The page limit stopped pagination before the result set was exhausted.
    pub truncated: bool,
}

/// Direct data-API access with a bearer token.
#[async_trait]
pub trait DataApi: Send + Sync {
    async fn search(&self, term: &str, bearer: &SecretString) -> Result<ApiResults, RetrievalError>;
}

/// HTTP implementation posting `{searchTerm, page, pageSize}` as JSON.
pub struct HttpDataApi {
    client: reqwest::Client,
    url: String,
    page_size: u32,
    max_pages: u32,
}

impl HttpDataApi {
    pub fn new(source: &SourceConfig) -> Result<Self, RetrievalError> {
        let client = reqwest::Client::builder()
            .timeout(source.request_timeout())
            .build()?;

        Ok(Self {
            client,
            url: source.data_api_url.clone(),
            page_size: source.page_size.max(1),
            max_pages: source.max_pages.max(1),
        })
    }

    async fn fetch_page(
        &self,
        term: &str,
        page: u32,
        bearer: &SecretString,
    ) -> Result<(Vec<Value>, Option<u64>), RetrievalError> {
        let resp = self
            .client
            .post(&self.url)
            .bearer_auth(bearer.expose_secret())
            .json(&json!({
                "searchTerm": term,
                "page": page,
                "pageSize": self.page_size,
            }))
            .send()
            .await?;

        let status = resp.status();
        let retry_after_secs = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());
        let body = resp.text().await?;

        classify_status(status, &body, retry_after_secs)?;
        parse_page(&body)
    }
}

#[async_trait]
impl DataApi for HttpDataApi {
    async fn search(&self, term: &str, bearer: &SecretString) -> Result<ApiResults, RetrievalError> {
        let mut results = ApiResults::default();
        let mut page = 1;

        loop {
            let (batch, total) = self.fetch_page(term, page, bearer).await?;
            let got = batch.len();
            results.rows.extend(batch);
            results.pages = page;

            debug!(
                url = %redact_url(&self.url),
                term,
                page,
                rows = got,
                total = ?total,
                "Fetched data API page"
            );

            if got < self.page_size as usize {
                break;
            }
            if total.is_some_and(|t| results.rows.len() as u64 >= t) {
                break;
            }
            if page >= self.max_pages {
                results.truncated = true;
                break;
            }
            page += 1;
        }

        Ok(results)
    }
}

fn classify_status(
    status: StatusCode,
    body: &str,
    retry_after_secs: Option<u64>,
) -> Result<(), RetrievalError> {
    if status.is_success() {
        return Ok(());
    }
    Err(match status.as_u16() {
        401 | 403 => RetrievalError::AuthExpired {
            status: status.as_u16(),
        },
        429 => RetrievalError::RateLimited { retry_after_secs },
        s if s >= 500 => RetrievalError::Server {
            status: s,
            body: truncate_body(body, ERROR_BODY_CHARS),
        },
        s => RetrievalError::Rejected {
            status: s,
            body: truncate_body(body, ERROR_BODY_CHARS),
        },
    })
}

/// Accepts a bare array or an envelope object holding the rows plus an
/// optional total count. Anything else is treated as suspicious.
fn parse_page(body: &str) -> Result<(Vec<Value>, Option<u64>), RetrievalError> {
    let trimmed = body.trim_start();
    if trimmed.starts_with('<') {
        return Err(RetrievalError::Suspicious(format!(
            "HTML body where JSON was expected: {}",
            truncate_body(trimmed, 80)
        )));
    }

    let value: Value = serde_json::from_str(trimmed).map_err(|e| {
        RetrievalError::Suspicious(format!(
            "non-JSON body ({}): {}",
            e,
            truncate_body(trimmed, 80)
        ))
    })?;

    match value {
        Value::Array(rows) => Ok((rows, None)),
        Value::Object(mut obj) => {
            let total = TOTAL_KEYS
                .iter()
                .find_map(|k| obj.get(*k).and_then(Value::as_u64));
            let key = RESULT_KEYS
                .iter()
                .find(|k| obj.get(**k).is_some_and(Value::is_array))
                .ok_or_else(|| {
                    RetrievalError::Suspicious("response object has no result array".to_string())
                })?;
            match obj.remove(*key) {
                Some(Value::Array(rows)) => Ok((rows, total)),
                _ => Err(RetrievalError::Suspicious(
                    "response object has no result array".to_string(),
                )),
            }
        }
        other => Err(RetrievalError::Suspicious(format!(
            "unexpected JSON response type: {}",
            truncate_body(&other.to_string(), 80)
        ))),
    }
}
