//! Test utilities: handwritten mocks of the collaborator traits.
//!
//! All mocks use `Arc<Mutex<_>>` so tests can assert on recorded calls.

use std::sync::{Arc, Mutex};

use crate::error::AppError;
use crate::resource::Resource;
use crate::traits::{Fetcher, LogRecord, LogSink, Severity};

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

/// Fetcher returning queued responses and recording requested URLs.
#[derive(Clone, Default)]
pub struct MockFetcher {
    /// Each call pops the first element; when empty a blank page is returned.
    responses: Arc<Mutex<Vec<Result<String, AppError>>>>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl MockFetcher {
    pub fn new(html: &str) -> Self {
        Self::with_responses(vec![Ok(html.to_string())])
    }

    pub fn with_error(error: AppError) -> Self {
        Self::with_responses(vec![Err(error)])
    }

    pub fn with_responses(responses: Vec<Result<String, AppError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            requests: Arc::default(),
        }
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

impl Fetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<String, AppError> {
        self.requests.lock().unwrap().push(url.to_string());
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok("<html><body></body></html>".to_string())
        } else {
            responses.remove(0)
        }
    }
}

// ---------------------------------------------------------------------------
// RecordingLogSink
// ---------------------------------------------------------------------------

/// Log sink that keeps every record.
#[derive(Clone, Default)]
pub struct RecordingLogSink {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl RecordingLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.severity == severity)
            .count()
    }

    /// True if any record's text contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.records
            .lock()
            .unwrap()
            .iter()
            .any(|r| r.text.contains(needle))
    }
}

impl LogSink for RecordingLogSink {
    fn log(&self, record: LogRecord) {
        self.records.lock().unwrap().push(record);
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// A listing resource with a title extractor and a `category` url variable.
pub fn listing_resource(id: &str, hostname: &str) -> Resource {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "hostname": hostname,
        "url_pattern": "/:category",
        "hash": format!("{id}-hash"),
        "variables": [{"kind": "url", "identifier": "category", "description": "Category"}],
        "descriptors": [{
            "kind": "selector:node",
            "selector": "h1",
            "extractors": [{
                "kind": "extractor:text",
                "key": "title",
                "transformers": [{"kind": "transformer:trim", "options": ["outside"]}]
            }]
        }]
    }))
    .expect("fixture resource is valid")
}
