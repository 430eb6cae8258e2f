use std::time::Duration;

use thiserror::Error;

/// Application-wide error types for Gleaner.
#[derive(Error, Debug)]
pub enum AppError {
    /// HTTP request failed or returned an unexpected status.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Operation did not finish in time.
    #[error("Timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A resource's `url_pattern` could not be compiled.
    #[error("Invalid url pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// A CSS selector in a resource could not be parsed.
    #[error("Invalid selector '{selector}': {reason}")]
    InvalidSelector { selector: String, reason: String },

    /// A node selector matched nothing and declared no recovery.
    #[error("No node was found and no fallback was provided [selector] {selector}")]
    MissingNode { selector: String },

    /// A transformer received a value of the wrong type.
    #[error("Invalid value for {transformer}: {value}")]
    InvalidValue {
        transformer: &'static str,
        value: String,
    },

    /// A regex transformer without replacement did not match.
    #[error("Regex did not match: {pattern}")]
    RegexNoMatch { pattern: String },

    /// A job does not belong to the resource it references.
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// A resource id is not present in any cached resource list.
    #[error("Resource {0} not found")]
    ResourceNotFound(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) => true,
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("reset")
            }
            _ => false,
        }
    }

    /// Returns true for errors caused by the resource schema or the page
    /// content rather than by the environment.
    pub fn is_extraction_error(&self) -> bool {
        matches!(
            self,
            AppError::InvalidSelector { .. }
                | AppError::MissingNode { .. }
                | AppError::InvalidValue { .. }
                | AppError::RegexNoMatch { .. }
                | AppError::InvalidPattern { .. }
        )
    }
}
