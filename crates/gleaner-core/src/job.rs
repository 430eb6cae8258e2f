//! Jobs issued by a coordinator and the results submitted back to it.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::AppError;
use crate::resource::{Payload, Resource, Variables};
use crate::route::RoutePattern;

/// How much a server trusts this client to act on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerAutonomy {
    /// Only pages the user visits are reported; jobs are never executed.
    Passive,
    /// Jobs may be fetched and executed out of band.
    Active,
}

impl ServerAutonomy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerAutonomy::Passive => "passive",
            ServerAutonomy::Active => "active",
        }
    }
}

impl fmt::Display for ServerAutonomy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A coordinator this client talks to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDefinition {
    pub id: String,
    pub name: String,
    /// Base URL of the coordinator API.
    pub url: String,
    /// Sent verbatim in the `Authorization` header.
    pub token: String,
    pub autonomy: ServerAutonomy,
}

/// A job as returned by `GET /worker/jobs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParameters {
    pub id: String,
    pub resource_id: String,
    pub url: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl JobParameters {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Where a submitted page came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum JobSource {
    /// Executed on behalf of the job with this id.
    Active { id: String },
    /// Seen while the user browsed.
    Passive,
}

/// Output of one page-processing pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapedPage {
    pub resource_id: String,
    pub payload: Payload,
    pub variables: Variables,
    pub source: JobSource,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSuccess {
    pub success: bool,
    pub payload: Payload,
    pub resource_id: String,
    pub variables: Variables,
    pub job: JobSource,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub success: bool,
    pub resource_id: String,
    pub source: JobSource,
    pub error: String,
}

/// Body of `POST /worker/jobs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobResult {
    Success(JobSuccess),
    Failure(JobFailure),
}

impl JobResult {
    pub fn success(page: ScrapedPage) -> Self {
        JobResult::Success(JobSuccess {
            success: true,
            payload: page.payload,
            resource_id: page.resource_id,
            variables: page.variables,
            job: page.source,
            warnings: page.warnings,
        })
    }

    pub fn failure(resource_id: impl Into<String>, source: JobSource, error: impl Into<String>) -> Self {
        JobResult::Failure(JobFailure {
            success: false,
            resource_id: resource_id.into(),
            source,
            error: error.into(),
        })
    }

    pub fn resource_id(&self) -> &str {
        match self {
            JobResult::Success(s) => &s.resource_id,
            JobResult::Failure(f) => &f.resource_id,
        }
    }

    pub fn source(&self) -> &JobSource {
        match self {
            JobResult::Success(s) => &s.job,
            JobResult::Failure(f) => &f.source,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobResult::Success(_))
    }
}

/// A job validated against the resource it targets.
///
/// Construction fails unless the URL belongs to the resource, so every
/// `Job` handed to an executor is well formed.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    params: JobParameters,
    resource: Resource,
    autonomy: ServerAutonomy,
    url: Url,
}

impl Job {
    pub fn new(
        params: JobParameters,
        resource: Resource,
        autonomy: ServerAutonomy,
    ) -> Result<Self, AppError> {
        let url = Url::parse(&params.url)
            .map_err(|e| AppError::InvalidJob(format!("unparseable url {}: {e}", params.url)))?;

        if resource.disabled {
            return Err(AppError::InvalidJob(format!(
                "resource {} is disabled",
                resource.id
            )));
        }

        if url.host_str() != Some(resource.hostname.as_str()) {
            return Err(AppError::InvalidJob(format!(
                "host of {} does not match resource hostname {}",
                params.url, resource.hostname
            )));
        }

        let pattern = RoutePattern::compile(&resource.url_pattern)?;
        if !pattern.is_match(url.path()) {
            return Err(AppError::InvalidJob(format!(
                "path of {} does not match pattern {}",
                params.url, resource.url_pattern
            )));
        }

        Ok(Self {
            params,
            resource,
            autonomy,
            url,
        })
    }

    pub fn id(&self) -> &str {
        &self.params.id
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn params(&self) -> &JobParameters {
        &self.params
    }

    pub fn autonomy(&self) -> ServerAutonomy {
        self.autonomy
    }

    pub fn source(&self) -> JobSource {
        JobSource::Active {
            id: self.params.id.clone(),
        }
    }
}
