use std::collections::HashMap;
use std::future::Future;

use scraper::ElementRef;
use serde::Serialize;

use crate::error::AppError;
use crate::job::ServerDefinition;

/// Fetches raw HTML content from a URL.
pub trait Fetcher: Send + Sync + Clone {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<String, AppError>> + Send;
}

/// A document that may still be changing, e.g. a page rendered by a host
/// browser. Each snapshot is the serialized DOM at that moment.
pub trait LiveDocument: Send + Sync {
    fn snapshot(&self) -> impl Future<Output = Result<String, AppError>> + Send;
}

impl LiveDocument for str {
    async fn snapshot(&self) -> Result<String, AppError> {
        Ok(self.to_string())
    }
}

impl LiveDocument for String {
    async fn snapshot(&self) -> Result<String, AppError> {
        Ok(self.clone())
    }
}

/// Supplies the ids of resources a server may be polled for.
pub trait ResourceAllowList: Send + Sync + 'static {
    fn enabled_resources(
        &self,
        server: &ServerDefinition,
    ) -> impl Future<Output = Result<Vec<String>, AppError>> + Send;
}

/// Allow-list with a fixed set of ids, shared by every server.
#[derive(Debug, Clone, Default)]
pub struct StaticAllowList(pub Vec<String>);

impl ResourceAllowList for StaticAllowList {
    async fn enabled_resources(&self, _server: &ServerDefinition) -> Result<Vec<String>, AppError> {
        Ok(self.0.clone())
    }
}

/// Computed style declarations of one element.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComputedStyle(HashMap<String, String>);

impl ComputedStyle {
    pub fn get(&self, property: &str) -> Option<&str> {
        self.0.get(&property.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn insert(&mut self, property: &str, value: &str) {
        self.0
            .insert(property.trim().to_ascii_lowercase(), value.trim().to_string());
    }
}

/// Resolves computed styles for the style extractor.
pub trait StyleResolver {
    /// `None` means no computed style is available for this element.
    fn computed_style(&self, element: &ElementRef<'_>, pseudo: Option<&str>)
    -> Option<ComputedStyle>;
}

/// Style resolver for static documents: reads the inline `style` attribute.
/// Pseudo-elements have no inline styles, so they always resolve to `None`.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineStyleResolver;

impl StyleResolver for InlineStyleResolver {
    fn computed_style(
        &self,
        element: &ElementRef<'_>,
        pseudo: Option<&str>,
    ) -> Option<ComputedStyle> {
        if pseudo.is_some_and(|p| !p.is_empty()) {
            return None;
        }
        let mut style = ComputedStyle::default();
        if let Some(inline) = element.value().attr("style") {
            for declaration in inline.split(';') {
                if let Some((property, value)) = declaration.split_once(':') {
                    style.insert(property, value);
                }
            }
        }
        Some(style)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
}

/// One entry for the logging collaborator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub severity: Severity,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl LogRecord {
    pub fn new(severity: Severity, text: impl Into<String>) -> Self {
        Self {
            severity,
            text: text.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Receives every failure, retry and pause decision of the sync client.
pub trait LogSink: Send + Sync + 'static {
    fn log(&self, record: LogRecord);
}

/// Log sink that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn log(&self, record: LogRecord) {
        let data = record.data.map(|d| d.to_string()).unwrap_or_default();
        match record.severity {
            Severity::Debug => tracing::debug!(%data, "{}", record.text),
            Severity::Info => tracing::info!(%data, "{}", record.text),
            Severity::Warning => tracing::warn!(%data, "{}", record.text),
            Severity::Error => tracing::error!(%data, "{}", record.text),
        }
    }
}
