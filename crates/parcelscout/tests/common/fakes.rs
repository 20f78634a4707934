//! Hand-written fakes for the retrieval seams and the result sink.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

use parcelscout::error::StorageError;
use parcelscout::retrieval::{ApiResults, BrowserCapture, CredentialCapturer, DataApi};
use parcelscout::storage::{JobOutcome, ResultSink, UpsertCounts};
use parcelscout::{ResultRecord, RetrievalError};

/// Data API returning scripted responses, then `fallback_rows` forever.
#[derive(Default)]
pub struct FakeDataApi {
    scripted: Mutex<VecDeque<Result<ApiResults, RetrievalError>>>,
    fallback_rows: Vec<Value>,
    calls: AtomicUsize,
    bearers: Mutex<Vec<String>>,
    terms: Mutex<Vec<String>>,
}

impl FakeDataApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every unscripted call returns these rows.
    pub fn returning(rows: Vec<Value>) -> Self {
        Self {
            fallback_rows: rows,
            ..Self::default()
        }
    }

    pub fn then(self, response: Result<ApiResults, RetrievalError>) -> Self {
        self.scripted
            .lock()
            .unwrap()
            .push_back(response);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Bearer tokens seen, in call order.
    pub fn bearers(&self) -> Vec<String> {
        self.bearers.lock().unwrap().clone()
    }

    pub fn terms(&self) -> Vec<String> {
        self.terms.lock().unwrap().clone()
    }
}

#[async_trait]
impl DataApi for FakeDataApi {
    async fn search(&self, term: &str, bearer: &SecretString) -> Result<ApiResults, RetrievalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.bearers
            .lock()
            .unwrap()
            .push(bearer.expose_secret().to_string());
        self.terms.lock().unwrap().push(term.to_string());

        if let Some(response) = self.scripted.lock().unwrap().pop_front() {
            return response;
        }
        Ok(ApiResults {
            rows: self.fallback_rows.clone(),
            pages: 1,
            truncated: false,
        })
    }
}

/// Browser capturer with scripted outcomes. Unscripted calls return
/// `fallback` rows and token.
#[derive(Default)]
pub struct FakeBrowser {
    scripted: Mutex<VecDeque<Result<BrowserCapture, RetrievalError>>>,
    fallback_rows: Vec<Value>,
    fallback_token: Option<String>,
    calls: AtomicUsize,
}

impl FakeBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn returning(rows: Vec<Value>, token: Option<&str>) -> Self {
        Self {
            fallback_rows: rows,
            fallback_token: token.map(str::to_string),
            ..Self::default()
        }
    }

    /// Every call fails with a browser error.
    pub fn broken() -> Self {
        let browser = Self::default();
        for _ in 0..64 {
            browser
                .scripted
                .lock()
                .unwrap()
                .push_back(Err(RetrievalError::Browser("page did not load".to_string())));
        }
        browser
    }

    pub fn then(self, response: Result<BrowserCapture, RetrievalError>) -> Self {
        self.scripted
            .lock()
            .unwrap()
            .push_back(response);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialCapturer for FakeBrowser {
    async fn capture(&self, _term: &str) -> Result<BrowserCapture, RetrievalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(response) = self.scripted.lock().unwrap().pop_front() {
            return response;
        }
        Ok(BrowserCapture {
            rows: self.fallback_rows.clone(),
            bearer_token: self
                .fallback_token
                .as_deref()
                .map(|t| SecretString::from(t.to_string())),
            truncated: false,
        })
    }
}

/// Result sink keeping everything in memory.
#[derive(Default)]
pub struct MemorySink {
    pub records: Mutex<Vec<ResultRecord>>,
    pub outcomes: Mutex<Vec<JobOutcome>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn outcomes(&self) -> Vec<JobOutcome> {
        self.outcomes.lock().unwrap().clone()
    }
}

impl ResultSink for MemorySink {
    fn upsert_results(&self, records: &[ResultRecord]) -> Result<UpsertCounts, StorageError> {
        let mut stored = self.records.lock().unwrap();
        let mut counts = UpsertCounts::default();
        for record in records {
            let existing = stored.iter_mut().find(|r| {
                r.external_id == record.external_id && r.assessment_year == record.assessment_year
            });
            match existing {
                Some(existing) => {
                    *existing = record.clone();
                    counts.updated += 1;
                }
                None => {
                    stored.push(record.clone());
                    counts.inserted += 1;
                }
            }
        }
        Ok(counts)
    }

    fn record_job_outcome(&self, outcome: &JobOutcome) -> Result<(), StorageError> {
        self.outcomes.lock().unwrap().push(outcome.clone());
        Ok(())
    }
}
