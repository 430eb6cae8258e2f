use std::time::Duration;

use gleaner_core::error::AppError;

/// Timing and retry knobs of the sync client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Period of the job poll timer. Zero disables the timer; the server is
    /// then polled once on start.
    pub poll_interval: Duration,
    /// Minimum time between two job executions.
    pub queue_interval: Duration,
    /// Minimum time between two scheduled resource refreshes of a server.
    pub resource_refresh_interval: Duration,
    /// Submission attempts before a precondition failure pauses the server.
    pub precondition_attempts: u32,
    /// Every n-th poll error pauses the server.
    pub pause_threshold: u32,
    /// Resume delay per recorded error.
    pub backoff_unit: Duration,
    /// Upper bound of the error multiplier.
    pub backoff_cap: u32,
    /// Timeout of every coordinator request.
    pub request_timeout: Duration,
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            queue_interval: Duration::from_secs(1),
            resource_refresh_interval: Duration::from_secs(5 * 60),
            precondition_attempts: 3,
            pause_threshold: 3,
            backoff_unit: Duration::from_secs(60),
            backoff_cap: 25,
            request_timeout: Duration::from_secs(30),
            user_agent: format!("Gleaner/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ClientConfig {
    /// Read overrides from the environment:
    ///
    /// - `GLEANER_POLL_INTERVAL_SECS`
    /// - `GLEANER_QUEUE_INTERVAL_SECS`
    /// - `GLEANER_REQUEST_TIMEOUT_SECS`
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let mut config = Self::default();
        if let Some(secs) = read_secs(&lookup, "GLEANER_POLL_INTERVAL_SECS")? {
            config.poll_interval = secs;
        }
        if let Some(secs) = read_secs(&lookup, "GLEANER_QUEUE_INTERVAL_SECS")? {
            config.queue_interval = secs;
        }
        if let Some(secs) = read_secs(&lookup, "GLEANER_REQUEST_TIMEOUT_SECS")? {
            if secs.is_zero() {
                return Err(AppError::ConfigError(
                    "GLEANER_REQUEST_TIMEOUT_SECS must be greater than zero".into(),
                ));
            }
            config.request_timeout = secs;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.precondition_attempts == 0 {
            return Err(AppError::ConfigError(
                "precondition_attempts must be at least 1".into(),
            ));
        }
        if self.pause_threshold == 0 {
            return Err(AppError::ConfigError(
                "pause_threshold must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Delay before a paused server resumes: linear in the error count,
    /// capped at `backoff_cap` units.
    pub fn resume_delay(&self, error_count: u32) -> Duration {
        self.backoff_unit * error_count.min(self.backoff_cap)
    }
}

fn read_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<Duration>, AppError> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<u64>()
        .map(|secs| Some(Duration::from_secs(secs)))
        .map_err(|_| AppError::ConfigError(format!("{key} must be a whole number of seconds, got '{raw}'")))
}
