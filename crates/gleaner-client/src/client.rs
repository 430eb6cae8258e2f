//! Keeps one or more coordinators in sync: caches their resources, polls them
//! for jobs, feeds the jobs through a throttled queue and submits results.
//!
//! The client talks to its host through two channels:
//!
//! - outbound [`ClientEvent`]s on an unbounded mpsc channel returned by
//!   [`SyncClient::new`];
//! - inbound page results via [`SyncClient::submit_page`] and
//!   [`SyncClient::submit_failure`].
//!
//! Every failure, retry and pause decision is reported to the [`LogSink`].

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use gleaner_core::error::AppError;
use gleaner_core::job::{
    Job, JobParameters, JobResult, JobSource, ScrapedPage, ServerAutonomy, ServerDefinition,
};
use gleaner_core::job_queue::JobQueue;
use gleaner_core::matcher::{PageDocument, PageMatcher};
use gleaner_core::resource::Resource;
use gleaner_core::traits::{LogRecord, LogSink, ResourceAllowList, Severity};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::protocol::{CoordinatorApi, SubmitOutcome, truncate_body};

const MAX_LOGGED_BODY: usize = 1000;

/// Notifications for the host.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A validated job is ready for execution.
    RunJob(Job),
    UpdatedResources {
        server: ServerDefinition,
        resources: Vec<Resource>,
    },
    Polled {
        server: ServerDefinition,
        jobs: Vec<JobParameters>,
    },
    /// A scheduled refresh was skipped because the last one is too recent.
    ResourceRateLimit {
        server: ServerDefinition,
        last_fetch: DateTime<Utc>,
    },
    /// A passive server issued a job; it is not executed.
    InsufficientAutonomyForJob {
        server: ServerDefinition,
        resource: Resource,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Idle,
    Polling,
    /// Stopped after repeated failures; resumes on its own.
    Paused,
}

/// A job waiting in the queue, tagged with the server that issued it.
#[derive(Debug, Clone)]
struct QueuedJob {
    server_id: String,
    params: JobParameters,
}

struct ServerState {
    definition: ServerDefinition,
    resources: Vec<Resource>,
    last_resource_fetch: Option<(Instant, DateTime<Utc>)>,
    error_count: u32,
    poll_token: Option<CancellationToken>,
    resume_token: Option<CancellationToken>,
    status: ServerStatus,
}

struct ServerSlot {
    state: Mutex<ServerState>,
    /// Serializes resource refreshes of this server.
    refresh: tokio::sync::Mutex<()>,
}

impl ServerSlot {
    fn new(definition: ServerDefinition) -> Self {
        Self {
            state: Mutex::new(ServerState {
                definition,
                resources: Vec::new(),
                last_resource_fetch: None,
                error_count: 0,
                poll_token: None,
                resume_token: None,
                status: ServerStatus::Idle,
            }),
            refresh: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn definition(&self) -> ServerDefinition {
        self.lock().definition.clone()
    }
}

#[derive(Default)]
struct Registry {
    slots: HashMap<String, Arc<ServerSlot>>,
    /// Insertion order, used by `start_all` and resource lookups.
    order: Vec<String>,
}

impl Registry {
    fn ordered(&self) -> Vec<Arc<ServerSlot>> {
        self.order
            .iter()
            .filter_map(|id| self.slots.get(id).cloned())
            .collect()
    }
}

struct Inner<A, L> {
    config: ClientConfig,
    api: CoordinatorApi,
    registry: Mutex<Registry>,
    queue: JobQueue<QueuedJob>,
    events: mpsc::UnboundedSender<ClientEvent>,
    allow_list: A,
    log: L,
}

/// Cloneable handle to the sync client.
pub struct SyncClient<A, L> {
    inner: Arc<Inner<A, L>>,
}

impl<A, L> Clone for SyncClient<A, L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: ResourceAllowList, L: LogSink> SyncClient<A, L> {
    /// Build a client and the receiver of its events.
    pub fn new(
        config: ClientConfig,
        allow_list: A,
        log: L,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>), AppError> {
        config.validate()?;
        let api = CoordinatorApi::new(config.request_timeout, &config.user_agent)?;
        let (events, receiver) = mpsc::unbounded_channel();

        let inner = Arc::new_cyclic(|weak: &Weak<Inner<A, L>>| {
            let weak = weak.clone();
            let queue = JobQueue::new(config.queue_interval, move |job: QueuedJob| {
                if let Some(inner) = weak.upgrade() {
                    inner.dispatch(job);
                }
            });
            Inner {
                config,
                api,
                registry: Mutex::new(Registry::default()),
                queue,
                events,
                allow_list,
                log,
            }
        });

        Ok((Self { inner }, receiver))
    }

    /// Register a server. A server with the same id is replaced.
    pub fn add_server(&self, definition: ServerDefinition) {
        let mut registry = self.inner.registry();
        let id = definition.id.clone();
        if registry
            .slots
            .insert(id.clone(), Arc::new(ServerSlot::new(definition)))
            .is_none()
        {
            registry.order.push(id);
        }
    }

    /// Replace the definition of a registered server. Takes effect on the
    /// next request.
    pub fn update_server(&self, definition: ServerDefinition) -> Result<(), AppError> {
        let Some(slot) = self.inner.slot(&definition.id) else {
            self.inner.log(
                Severity::Error,
                "Tried to update a server that is not registered",
                Some(json!({ "server": definition.id, "url": definition.url })),
            );
            return Err(AppError::ConfigError(format!(
                "Unknown server {}",
                definition.id
            )));
        };
        slot.lock().definition = definition;
        Ok(())
    }

    pub fn servers(&self) -> Vec<ServerDefinition> {
        self.inner
            .registry()
            .ordered()
            .iter()
            .map(|slot| slot.definition())
            .collect()
    }

    /// Every cached resource of every server.
    pub fn all_resources(&self) -> Vec<Resource> {
        self.inner
            .registry()
            .ordered()
            .iter()
            .flat_map(|slot| slot.lock().resources.clone())
            .collect()
    }

    pub fn server_status(&self, server_id: &str) -> Option<ServerStatus> {
        self.inner.slot(server_id).map(|slot| slot.lock().status)
    }

    pub fn error_count(&self, server_id: &str) -> Option<u32> {
        self.inner.slot(server_id).map(|slot| slot.lock().error_count)
    }

    /// Jobs received but not yet dispatched.
    pub fn queued_jobs(&self) -> usize {
        self.inner.queue.size()
    }

    /// A matcher over the cached resources of all servers.
    pub fn page_matcher(&self, document: PageDocument) -> PageMatcher {
        PageMatcher::new(document, self.all_resources())
    }

    /// Start the job queue, then every server in registration order.
    pub async fn start_all(&self) {
        self.inner.queue.start();
        let slots = self.inner.registry().ordered();
        for slot in slots {
            self.inner.start_server(slot).await;
        }
    }

    pub async fn start(&self, server_id: &str) -> Result<(), AppError> {
        let slot = self
            .inner
            .slot(server_id)
            .ok_or_else(|| AppError::ConfigError(format!("Unknown server {server_id}")))?;
        self.inner.start_server(slot).await;
        Ok(())
    }

    /// Cancel the poll and resume timers of a server. Cached resources and
    /// the error count are kept. Stopping twice is a no-op.
    pub fn stop(&self, server_id: &str) {
        if let Some(slot) = self.inner.slot(server_id) {
            Inner::<A, L>::stop_slot(&slot);
        }
    }

    pub fn stop_all(&self) {
        self.inner.queue.stop();
        for slot in self.inner.registry().ordered() {
            Inner::<A, L>::stop_slot(&slot);
        }
    }

    /// Submit a processed page.
    pub async fn submit_page(&self, page: ScrapedPage) {
        self.inner.submit(JobResult::success(page)).await;
    }

    /// Report that a job could not be completed.
    pub async fn submit_failure(&self, resource_id: &str, source: JobSource, error: &str) {
        self.inner
            .submit(JobResult::failure(resource_id, source, error))
            .await;
    }

    /// Submit the outcome of an executed job.
    pub async fn submit_result(&self, result: JobResult) {
        self.inner.submit(result).await;
    }
}

impl<A: ResourceAllowList, L: LogSink> Inner<A, L> {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, server_id: &str) -> Option<Arc<ServerSlot>> {
        self.registry().slots.get(server_id).cloned()
    }

    /// The first server whose cache holds `resource_id`, with that resource.
    fn find_resource(&self, resource_id: &str) -> Option<(Arc<ServerSlot>, Resource)> {
        self.registry().ordered().into_iter().find_map(|slot| {
            let resource = slot
                .lock()
                .resources
                .iter()
                .find(|r| r.id == resource_id)
                .cloned();
            resource.map(|r| (slot, r))
        })
    }

    fn log(&self, severity: Severity, text: impl Into<String>, data: Option<serde_json::Value>) {
        let record = LogRecord::new(severity, text);
        self.log.log(match data {
            Some(data) => record.with_data(data),
            None => record,
        });
    }

    fn emit(&self, event: ClientEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("Client event dropped, receiver is gone");
        }
    }

    /// Refresh, start the poll timer and poll once.
    ///
    /// Boxed because a paused server resumes through this same path.
    fn start_server(
        self: &Arc<Self>,
        slot: Arc<ServerSlot>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
        let inner = Arc::clone(self);
        Box::pin(async move {
            let token = CancellationToken::new();
            let server = {
                let mut state = slot.lock();
                if let Some(previous) = state.poll_token.replace(token.clone()) {
                    previous.cancel();
                }
                if let Some(resume) = state.resume_token.take() {
                    resume.cancel();
                }
                state.status = ServerStatus::Polling;
                state.definition.clone()
            };
            tracing::info!(server = %server.id, url = %server.url, "Starting server");

            inner.refresh_resources(&slot, false).await;
            if token.is_cancelled() {
                return;
            }

            let period = inner.config.poll_interval;
            if !period.is_zero() {
                let timer_inner = Arc::clone(&inner);
                let timer_slot = Arc::clone(&slot);
                let timer_token = token.clone();
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    // The first tick completes immediately; start polls once itself.
                    ticker.tick().await;
                    loop {
                        tokio::select! {
                            _ = timer_token.cancelled() => break,
                            _ = ticker.tick() => timer_inner.poll(&timer_slot).await,
                        }
                    }
                });
            }

            inner.poll(&slot).await;
        })
    }

    fn stop_slot(slot: &ServerSlot) {
        let mut state = slot.lock();
        if let Some(token) = state.poll_token.take() {
            token.cancel();
        }
        if let Some(token) = state.resume_token.take() {
            token.cancel();
        }
        state.status = ServerStatus::Idle;
    }

    /// Stop the server and schedule a restart after the backoff delay.
    fn pause(self: &Arc<Self>, slot: &Arc<ServerSlot>) {
        Self::stop_slot(slot);
        let token = CancellationToken::new();
        let (server, delay) = {
            let mut state = slot.lock();
            state.status = ServerStatus::Paused;
            state.resume_token = Some(token.clone());
            (
                state.definition.clone(),
                self.config.resume_delay(state.error_count),
            )
        };

        self.log(
            Severity::Warning,
            format!(
                "Pausing server {} for {}s after repeated errors",
                server.name,
                delay.as_secs()
            ),
            Some(json!({ "server": server.id, "delay_secs": delay.as_secs() })),
        );

        let inner = Arc::clone(self);
        let slot = Arc::clone(slot);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    inner.log(
                        Severity::Info,
                        format!("Restarting polling of {}", server.name),
                        None,
                    );
                    inner.start_server(slot).await;
                }
            }
        });
    }

    /// Fetch and cache the server's resources.
    ///
    /// Unless `force` is set, a refresh within `resource_refresh_interval`
    /// of the previous one only emits [`ClientEvent::ResourceRateLimit`].
    async fn refresh_resources(&self, slot: &ServerSlot, force: bool) {
        let _guard = slot.refresh.lock().await;

        let (server, last) = {
            let state = slot.lock();
            (state.definition.clone(), state.last_resource_fetch)
        };
        if !force
            && let Some((at, wall)) = last
            && at.elapsed() < self.config.resource_refresh_interval
        {
            tracing::debug!(server = %server.id, "Resource refresh rate limited");
            self.emit(ClientEvent::ResourceRateLimit {
                server,
                last_fetch: wall,
            });
            return;
        }

        let result = self.api.fetch_resources(&server).await;
        let fetched = {
            let mut state = slot.lock();
            state.last_resource_fetch = Some((Instant::now(), Utc::now()));
            match result {
                Ok(body) => {
                    state.resources = body.resources.clone();
                    Ok(body.resources)
                }
                Err(e) => Err(e),
            }
        };

        match fetched {
            Ok(resources) => {
                tracing::info!(server = %server.id, count = resources.len(), "Resources updated");
                self.emit(ClientEvent::UpdatedResources { server, resources });
            }
            Err(e) => self.log(
                Severity::Error,
                format!("Error updating resources of {}: {e}", server.name),
                Some(json!({ "server": server.id, "message": e.to_string() })),
            ),
        }
    }

    fn spawn_refresh(self: &Arc<Self>, slot: &Arc<ServerSlot>) {
        let inner = Arc::clone(self);
        let slot = Arc::clone(slot);
        tokio::spawn(async move { inner.refresh_resources(&slot, false).await });
    }

    /// Poll once. Every `pause_threshold`-th error pauses the server.
    async fn poll(self: &Arc<Self>, slot: &Arc<ServerSlot>) {
        let server = slot.definition();
        let Err(e) = self.poll_once(slot, &server).await else {
            return;
        };

        let count = {
            let mut state = slot.lock();
            state.error_count += 1;
            state.error_count
        };
        self.log(
            Severity::Error,
            format!("Error polling for new jobs: {} {e}", server.name),
            Some(json!({
                "server": server.id,
                "message": e.to_string(),
                "error_count": count,
            })),
        );
        if count % self.config.pause_threshold == 0 {
            self.pause(slot);
        }
    }

    async fn poll_once(
        self: &Arc<Self>,
        slot: &Arc<ServerSlot>,
        server: &ServerDefinition,
    ) -> Result<(), AppError> {
        let resource_ids = self.allow_list.enabled_resources(server).await?;
        let body = self
            .api
            .poll_jobs(server, server.autonomy, &resource_ids)
            .await?;

        tracing::debug!(server = %server.id, jobs = body.jobs.len(), "Polled");
        self.emit(ClientEvent::Polled {
            server: server.clone(),
            jobs: body.jobs.clone(),
        });

        if body.wants_resources() {
            self.log(
                Severity::Info,
                "The server requested a refetch because the resources have changed",
                Some(json!({ "server": server.id })),
            );
            self.refresh_resources(slot, true).await;
        }

        for params in body.jobs {
            self.queue.add_job(QueuedJob {
                server_id: server.id.clone(),
                params,
            });
        }
        Ok(())
    }

    /// Queue consumer: turn a queued job into a [`ClientEvent::RunJob`].
    fn dispatch(self: &Arc<Self>, queued: QueuedJob) {
        let QueuedJob { server_id, params } = queued;

        if params.is_expired(Utc::now()) {
            self.log(
                Severity::Warning,
                format!("Dropping expired job {}", params.id),
                Some(json!({ "job_id": params.id, "expires_at": params.expires_at })),
            );
            return;
        }

        let Some(slot) = self.slot(&server_id) else {
            self.log(
                Severity::Error,
                format!("Job {} belongs to unknown server {server_id}", params.id),
                None,
            );
            return;
        };

        let (server, resource) = {
            let state = slot.lock();
            let resource = state
                .resources
                .iter()
                .find(|r| r.id == params.resource_id)
                .cloned();
            (state.definition.clone(), resource)
        };

        let Some(resource) = resource else {
            self.log(
                Severity::Error,
                format!("Could not find resource {}", params.resource_id),
                Some(json!({ "server": server.id, "job_id": params.id })),
            );
            self.spawn_refresh(&slot);
            return;
        };

        if server.autonomy == ServerAutonomy::Passive {
            self.log(
                Severity::Warning,
                format!(
                    "Ignoring job request from {} because the server is in passive mode",
                    server.url
                ),
                Some(json!({ "server": server.id, "job_id": params.id })),
            );
            self.emit(ClientEvent::InsufficientAutonomyForJob { server, resource });
            return;
        }

        let job_id = params.id.clone();
        match Job::new(params, resource, server.autonomy) {
            Ok(job) => {
                tracing::info!(job_id = %job.id(), url = %job.url(), "Dispatching job");
                self.emit(ClientEvent::RunJob(job));
            }
            Err(e) => {
                self.log(
                    Severity::Error,
                    format!("Rejected job {job_id}: {e}"),
                    Some(json!({ "server": server.id, "job_id": job_id })),
                );
                self.spawn_refresh(&slot);
            }
        }
    }

    /// POST a result, refreshing and retrying on precondition failures.
    async fn submit(self: &Arc<Self>, result: JobResult) {
        let resource_id = result.resource_id().to_string();
        let Some((slot, _)) = self.find_resource(&resource_id) else {
            self.log(
                Severity::Error,
                format!("Could not find resource {resource_id}"),
                None,
            );
            return;
        };

        let attempts = self.config.precondition_attempts;
        for attempt in 1..=attempts {
            let (server, resource, status) = {
                let state = slot.lock();
                let resource = state.resources.iter().find(|r| r.id == resource_id).cloned();
                (state.definition.clone(), resource, state.status)
            };

            if status == ServerStatus::Paused {
                self.log(
                    Severity::Warning,
                    format!("Dropping submission for {resource_id}, {} is paused", server.name),
                    Some(json!({ "server": server.id, "resource_id": resource_id })),
                );
                return;
            }
            let Some(resource) = resource else {
                self.log(
                    Severity::Error,
                    format!("Resource {resource_id} disappeared while submitting"),
                    Some(json!({ "server": server.id })),
                );
                return;
            };

            match self.api.submit(&server, &resource.hash, &result).await {
                Ok(SubmitOutcome::Accepted) => {
                    let kind = match result.source() {
                        JobSource::Active { .. } => "active",
                        JobSource::Passive => "passive",
                    };
                    self.log(
                        Severity::Info,
                        format!("Successfully submitted ({kind}) job {resource_id}"),
                        None,
                    );
                    return;
                }
                Ok(SubmitOutcome::PreconditionFailed) if attempt < attempts => {
                    self.log(
                        Severity::Warning,
                        "Failed job precondition while submitting. Trying to refresh and re-submit...",
                        Some(json!({
                            "resource_id": resource_id,
                            "hash": resource.hash,
                            "attempt": attempt,
                        })),
                    );
                    self.refresh_resources(&slot, true).await;
                }
                Ok(SubmitOutcome::PreconditionFailed) => {
                    self.log(
                        Severity::Error,
                        format!(
                            "Failed job precondition {attempts} times while submitting, giving up and pausing"
                        ),
                        Some(json!({
                            "resource_id": resource_id,
                            "hash": resource.hash,
                            "attempts": attempts,
                        })),
                    );
                    slot.lock().error_count += 1;
                    self.pause(&slot);
                    return;
                }
                Ok(SubmitOutcome::Rejected { status, body }) => {
                    self.log(
                        Severity::Error,
                        format!("Failed to submit job for resource: {resource_id}"),
                        Some(json!({
                            "status": status,
                            "response": truncate_body(&body, MAX_LOGGED_BODY),
                        })),
                    );
                    return;
                }
                Err(e) => {
                    self.log(
                        Severity::Error,
                        format!("Failed to submit job for resource: {resource_id}: {e}"),
                        Some(json!({ "server": server.id, "message": e.to_string() })),
                    );
                    return;
                }
            }
        }
    }
}
