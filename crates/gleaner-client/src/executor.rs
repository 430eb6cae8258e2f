use std::time::Duration;

use gleaner_core::error::AppError;
use gleaner_core::job::{Job, JobResult};
use gleaner_core::matcher::{PageCheck, PageDocument, PageMatcher};
use gleaner_core::page::process_page;
use gleaner_core::traits::Fetcher;

/// Executes active jobs: fetch the job URL, match it against the job's
/// resource and extract the payload.
#[derive(Clone)]
pub struct JobExecutor<F> {
    fetcher: F,
    timeout: Duration,
}

impl<F: Fetcher> JobExecutor<F> {
    /// Executor with a 10 s fetch timeout.
    pub fn new(fetcher: F) -> Self {
        Self {
            fetcher,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run a job to completion. Never fails: errors become a failure result.
    pub async fn execute(&self, job: &Job) -> JobResult {
        let source = job.source();
        let resource_id = job.resource().id.clone();

        let fetched = tokio::time::timeout(self.timeout, self.fetcher.fetch(job.url().as_str()))
            .await
            .unwrap_or(Err(AppError::Timeout(self.timeout)));
        let body = match fetched {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(job_id = %job.id(), url = %job.url(), error = %e, "Job fetch failed");
                return JobResult::failure(resource_id, source, e.to_string());
            }
        };

        let document = PageDocument::from_html(job.url().clone(), &body);
        let matcher = PageMatcher::new(document, vec![job.resource().clone()]);
        match matcher.check_current_page() {
            PageCheck::Match(matched) => {
                let page = process_page(matcher.document(), matched, source);
                tracing::info!(
                    job_id = %job.id(),
                    resource_id = %page.resource_id,
                    warnings = page.warnings.len(),
                    "Job executed"
                );
                JobResult::success(page)
            }
            PageCheck::Fail(reason) => {
                tracing::warn!(job_id = %job.id(), %reason, "Job page did not match");
                JobResult::failure(resource_id, source, format!("Page check failed: {reason}"))
            }
        }
    }
}
