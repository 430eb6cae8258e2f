//! HTTP protocol spoken with a coordinator.
//!
//! - `GET  /resources` returns the resource list
//! - `GET  /worker/jobs?autonomy=..&resource[]=..` polls for jobs
//! - `POST /worker/jobs` submits a [`JobResult`] guarded by `If-Match`

use std::time::Duration;

use gleaner_core::error::AppError;
use gleaner_core::job::{JobParameters, JobResult, ServerAutonomy, ServerDefinition};
use gleaner_core::resource::ResourcesResponse;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, IF_MATCH};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use url::Url;
use uuid::Uuid;

pub const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";
pub const IDEMPOTENCY_KEY: &str = "Idempotency-Key";

/// Something the coordinator asks the client to reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefetchTarget {
    Resources,
    #[serde(other)]
    Unknown,
}

/// Body of `GET /worker/jobs`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JobPollResponse {
    #[serde(default)]
    pub jobs: Vec<JobParameters>,
    #[serde(default)]
    pub refetch: Option<Vec<RefetchTarget>>,
}

impl JobPollResponse {
    pub fn wants_resources(&self) -> bool {
        self.refetch
            .as_ref()
            .is_some_and(|targets| targets.contains(&RefetchTarget::Resources))
    }
}

/// Outcome of a job submission that reached the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    /// HTTP 412: the resource hash is stale.
    PreconditionFailed,
    Rejected { status: u16, body: String },
}

/// Thin typed wrapper over the coordinator endpoints.
#[derive(Clone)]
pub struct CoordinatorApi {
    client: Client,
    timeout: Duration,
}

impl CoordinatorApi {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;
        Ok(Self { client, timeout })
    }

    pub async fn fetch_resources(
        &self,
        server: &ServerDefinition,
    ) -> Result<ResourcesResponse, AppError> {
        let url = endpoint(&server.url, "/resources")?;
        let response = self
            .client
            .get(url)
            .headers(base_headers(server)?)
            .send()
            .await
            .map_err(|e| request_error(e, self.timeout))?;
        read_json(response).await
    }

    pub async fn poll_jobs(
        &self,
        server: &ServerDefinition,
        autonomy: ServerAutonomy,
        resource_ids: &[String],
    ) -> Result<JobPollResponse, AppError> {
        let mut url = endpoint(&server.url, "/worker/jobs")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("autonomy", autonomy.as_str());
            for id in resource_ids {
                query.append_pair("resource[]", id);
            }
        }
        let response = self
            .client
            .get(url)
            .headers(base_headers(server)?)
            .send()
            .await
            .map_err(|e| request_error(e, self.timeout))?;
        read_json(response).await
    }

    pub async fn submit(
        &self,
        server: &ServerDefinition,
        resource_hash: &str,
        result: &JobResult,
    ) -> Result<SubmitOutcome, AppError> {
        let url = endpoint(&server.url, "/worker/jobs")?;
        let mut headers = base_headers(server)?;
        headers.insert(IF_MATCH, header_value(resource_hash)?);

        let response = self
            .client
            .post(url)
            .headers(headers)
            .body(serde_json::to_vec(result)?)
            .send()
            .await
            .map_err(|e| request_error(e, self.timeout))?;

        let status = response.status();
        if status == StatusCode::PRECONDITION_FAILED {
            return Ok(SubmitOutcome::PreconditionFailed);
        }
        if status.is_success() {
            return Ok(SubmitOutcome::Accepted);
        }
        let body = response.text().await.unwrap_or_default();
        Ok(SubmitOutcome::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

fn endpoint(base: &str, path: &str) -> Result<Url, AppError> {
    Url::parse(base)
        .and_then(|base| base.join(path))
        .map_err(|e| AppError::ConfigError(format!("Invalid server url {base}: {e}")))
}

fn header_value(value: &str) -> Result<HeaderValue, AppError> {
    HeaderValue::from_str(value)
        .map_err(|e| AppError::ConfigError(format!("Invalid header value: {e}")))
}

/// Headers carried by every coordinator request.
fn base_headers(server: &ServerDefinition) -> Result<HeaderMap, AppError> {
    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, header_value(&server.token)?);
    headers.insert(IDEMPOTENCY_KEY, header_value(&Uuid::new_v4().to_string())?);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
    Ok(headers)
}

async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, AppError> {
    let status = response.status();
    if !status.is_success() {
        return Err(AppError::HttpError(format!(
            "HTTP {} for {}",
            status.as_u16(),
            response.url()
        )));
    }
    let body = response
        .text()
        .await
        .map_err(|e| AppError::HttpError(format!("Failed to read response body: {e}")))?;
    Ok(serde_json::from_str(&body)?)
}

/// Classify a transport error the same way for every request.
pub(crate) fn request_error(e: reqwest::Error, timeout: Duration) -> AppError {
    if e.is_timeout() {
        AppError::Timeout(timeout)
    } else if e.is_connect() {
        AppError::NetworkError(format!("Connection failed: {e}"))
    } else {
        AppError::HttpError(e.to_string())
    }
}

/// Cap a response body for logging.
pub fn truncate_body(body: &str, max_chars: usize) -> String {
    if body.chars().count() <= max_chars {
        return body.to_string();
    }
    let kept: String = body.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{kept}...")
}
