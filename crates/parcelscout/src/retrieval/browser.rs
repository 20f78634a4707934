//! Slow path: a headless browser driven through a Browserless-compatible
//! `/function` endpoint.
//!
//! The same capture serves two callers: the retrieval engine (rows) and the
//! token manager (the bearer token observed in the page's own traffic).

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::RetrievalError;
use crate::config::{BrowserConfig, SelectorConfig, SourceConfig};
use crate::sanitize::{redact_url, token_fingerprint, truncate_body};
use crate::secrets::resolve_secret_optional;

const SEARCH_SCRIPT: &str = include_str!("browser_search.js");

/// Extra HTTP timeout on top of the in-browser navigation timeout.
const HTTP_SLACK: Duration = Duration::from_secs(10);

/// What one browser-driven search produced.
#[derive(Debug, Default)]
pub struct BrowserCapture {
    /// Grid rows keyed by column header.
    pub rows: Vec<Value>,
    pub bearer_token: Option<SecretString>,
    /// The grid held more rows than were harvested.
    pub truncated: bool,
}

/// Drives the source's search UI and captures the bearer token it uses.
#[async_trait]
pub trait CredentialCapturer: Send + Sync {
    async fn capture(&self, term: &str) -> Result<BrowserCapture, RetrievalError>;
}

pub struct BrowserlessCapturer {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
    search_url: String,
    api_host_pattern: String,
    row_cap: u32,
    timeout: Duration,
    selectors: SelectorConfig,
}

impl BrowserlessCapturer {
    pub fn new(browser: &BrowserConfig, source: &SourceConfig) -> Result<Self, RetrievalError> {
        let api_key = resolve_secret_optional(
            browser.api_key.as_deref(),
            browser.api_key_file.as_deref(),
            browser.api_key_env_var.as_deref(),
        )
        .map_err(|e| RetrievalError::Browser(format!("browser API key: {}", e)))?;

        let timeout = Duration::from_secs(browser.timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout + HTTP_SLACK)
            .build()?;

        Ok(Self {
            client,
            base_url: browser.endpoint.trim_end_matches('/').to_string(),
            api_key,
            search_url: source.search_page_url.clone(),
            api_host_pattern: source.capture_pattern(),
            row_cap: browser.row_cap,
            timeout,
            selectors: browser.selectors.clone(),
        })
    }

    fn function_url(&self) -> String {
        let mut endpoint = format!("{}/function", self.base_url);
        if let Some(ref key) = self.api_key {
            endpoint.push_str(&format!("?token={}", key.expose_secret()));
        }
        endpoint
    }
}

#[async_trait]
impl CredentialCapturer for BrowserlessCapturer {
    async fn capture(&self, term: &str) -> Result<BrowserCapture, RetrievalError> {
        let endpoint = self.function_url();
        let body = json!({
            "code": SEARCH_SCRIPT,
            "context": {
                "term": term,
                "searchUrl": self.search_url,
                "apiHostPattern": self.api_host_pattern,
                "rowCap": self.row_cap,
                "timeoutMs": self.timeout.as_millis() as u64,
                "selectors": {
                    "searchInput": self.selectors.search_input,
                    "submit": self.selectors.submit,
                    "resultRow": self.selectors.result_row,
                    "headerCell": self.selectors.header_cell,
                    "noResults": self.selectors.no_results,
                    "nextPage": self.selectors.next_page,
                },
            },
        });

        debug!(endpoint = %redact_url(&endpoint), term, "Starting browser search");

        let resp = self
            .client
            .post(&endpoint)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(RetrievalError::Browser(format!(
                "browser endpoint returned {}: {}",
                status.as_u16(),
                truncate_body(&text, 200)
            )));
        }

        let capture = parse_capture(&text)?;
        let fingerprint = capture
            .bearer_token
            .as_ref()
            .map(|t| token_fingerprint(t.expose_secret()))
            .unwrap_or_else(|| "none".to_string());
        info!(
            term,
            rows = capture.rows.len(),
            truncated = capture.truncated,
            token = %fingerprint,
            "Browser search finished"
        );
        Ok(capture)
    }
}

#[derive(Deserialize)]
struct CaptureResponse {
    #[serde(default)]
    rows: Vec<Value>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    truncated: bool,
}

/// Parses the script result, with or without the `{data, type}` wrapper.
fn parse_capture(text: &str) -> Result<BrowserCapture, RetrievalError> {
    let mut value: Value = serde_json::from_str(text).map_err(|e| {
        RetrievalError::Browser(format!(
            "unreadable browser result ({}): {}",
            e,
            truncate_body(text, 80)
        ))
    })?;

    if value.get("data").is_some_and(Value::is_object) {
        if let Some(inner) = value.get_mut("data").map(Value::take) {
            value = inner;
        }
    }

    let response: CaptureResponse = serde_json::from_value(value)
        .map_err(|e| RetrievalError::Browser(format!("unexpected browser result: {}", e)))?;

    Ok(BrowserCapture {
        rows: response.rows,
        bearer_token: response
            .token
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .map(SecretString::from),
        truncated: response.truncated,
    })
}
