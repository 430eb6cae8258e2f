//! Sync client against a mocked coordinator.

use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use gleaner_client::{ClientConfig, ClientEvent, ServerStatus, SyncClient};
use gleaner_core::job::{JobSource, ScrapedPage, ServerAutonomy, ServerDefinition};
use gleaner_core::resource::Resource;
use gleaner_core::testutil::{RecordingLogSink, listing_resource};
use gleaner_core::traits::{Severity, StaticAllowList};
use serde_json::{Value, json};
use tokio::sync::mpsc::UnboundedReceiver;
use wiremock::matchers::{header, header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

type Client = SyncClient<StaticAllowList, RecordingLogSink>;

const WAIT: Duration = Duration::from_secs(2);

fn config() -> ClientConfig {
    ClientConfig {
        poll_interval: Duration::ZERO,
        queue_interval: Duration::from_millis(10),
        backoff_unit: Duration::from_secs(3600),
        request_timeout: Duration::from_secs(5),
        ..ClientConfig::default()
    }
}

fn server_def(server: &MockServer, autonomy: ServerAutonomy) -> ServerDefinition {
    ServerDefinition {
        id: "coord".into(),
        name: "Local coordinator".into(),
        url: server.uri(),
        token: "secret-token".into(),
        autonomy,
    }
}

fn resource() -> Resource {
    listing_resource("listing", "www.example.com")
}

fn resources_body() -> Value {
    json!({ "name": "Local coordinator", "resources": [resource()] })
}

fn job(id: &str, expires_in: ChronoDuration) -> Value {
    let now = Utc::now();
    json!({
        "id": id,
        "resource_id": "listing",
        "url": "https://www.example.com/emlak",
        "issued_at": now,
        "expires_at": now + expires_in,
    })
}

fn page() -> ScrapedPage {
    let mut payload = serde_json::Map::new();
    payload.insert("title".into(), json!("Emlak"));
    ScrapedPage {
        resource_id: "listing".into(),
        payload,
        variables: serde_json::Map::new(),
        source: JobSource::Passive,
        warnings: Vec::new(),
    }
}

async fn mount_resources(server: &MockServer, times: u64) {
    Mock::given(method("GET"))
        .and(path("/resources"))
        .respond_with(ResponseTemplate::new(200).set_body_json(resources_body()))
        .expect(times)
        .mount(server)
        .await;
}

async fn mount_jobs(server: &MockServer, body: Value) {
    Mock::given(method("GET"))
        .and(path("/worker/jobs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

fn client(config: ClientConfig) -> (Client, UnboundedReceiver<ClientEvent>, RecordingLogSink) {
    let log = RecordingLogSink::new();
    let (client, rx) =
        SyncClient::new(config, StaticAllowList(vec!["listing".into()]), log.clone()).unwrap();
    (client, rx, log)
}

/// Receive events until `pick` accepts one.
async fn next_matching<T>(
    rx: &mut UnboundedReceiver<ClientEvent>,
    mut pick: impl FnMut(ClientEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if let Some(found) = pick(event) {
                return found;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn drain(rx: &mut UnboundedReceiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_start_loads_resources_once_and_polls() {
    let server = MockServer::start().await;
    mount_resources(&server, 1).await;
    mount_jobs(&server, json!({ "jobs": [] })).await;

    let (client, mut rx, _log) = client(config());
    client.add_server(server_def(&server, ServerAutonomy::Active));
    client.start_all().await;

    let resources = next_matching(&mut rx, |e| match e {
        ClientEvent::UpdatedResources { resources, .. } => Some(resources),
        _ => None,
    })
    .await;
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0].id, "listing");

    next_matching(&mut rx, |e| matches!(e, ClientEvent::Polled { .. }).then_some(())).await;
    assert_eq!(client.all_resources().len(), 1);
    assert_eq!(client.server_status("coord"), Some(ServerStatus::Polling));

    client.stop_all();
    assert_eq!(client.server_status("coord"), Some(ServerStatus::Idle));
    assert!(
        !drain(&mut rx)
            .iter()
            .any(|e| matches!(e, ClientEvent::UpdatedResources { .. }))
    );
}

#[tokio::test]
async fn test_polled_jobs_are_dispatched_one_by_one() {
    let server = MockServer::start().await;
    mount_resources(&server, 1).await;
    mount_jobs(
        &server,
        json!({ "jobs": [job("job-1", ChronoDuration::minutes(5)), job("job-2", ChronoDuration::minutes(5))] }),
    )
    .await;

    let (client, mut rx, _log) = client(config());
    client.add_server(server_def(&server, ServerAutonomy::Active));
    client.start_all().await;

    let mut ids = Vec::new();
    for _ in 0..2 {
        let job = next_matching(&mut rx, |e| match e {
            ClientEvent::RunJob(job) => Some(job),
            _ => None,
        })
        .await;
        assert_eq!(job.resource().id, "listing");
        assert_eq!(job.url().as_str(), "https://www.example.com/emlak");
        ids.push(job.id().to_string());
    }
    assert_eq!(ids, vec!["job-1", "job-2"]);
    assert_eq!(client.queued_jobs(), 0);
    client.stop_all();
}

#[tokio::test]
async fn test_poll_sends_credentials_and_filters() {
    let server = MockServer::start().await;
    mount_resources(&server, 1).await;
    Mock::given(method("GET"))
        .and(path("/worker/jobs"))
        .and(header("authorization", "secret-token"))
        .and(header_exists("idempotency-key"))
        .and(header("content-type", "application/json; charset=utf-8"))
        .and(query_param("autonomy", "active"))
        .and(query_param("resource[]", "listing"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "jobs": [] })))
        .expect(1)
        .mount(&server)
        .await;

    let (client, mut rx, log) = client(config());
    client.add_server(server_def(&server, ServerAutonomy::Active));
    client.start_all().await;

    next_matching(&mut rx, |e| matches!(e, ClientEvent::Polled { .. }).then_some(())).await;
    assert_eq!(client.error_count("coord"), Some(0));
    assert_eq!(log.count(Severity::Error), 0);
    client.stop_all();
}

#[tokio::test]
async fn test_passive_server_jobs_are_not_run() {
    let server = MockServer::start().await;
    mount_resources(&server, 1).await;
    Mock::given(method("GET"))
        .and(path("/worker/jobs"))
        .and(query_param("autonomy", "passive"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "jobs": [job("job-1", ChronoDuration::minutes(5))] })),
        )
        .mount(&server)
        .await;

    let (client, mut rx, log) = client(config());
    client.add_server(server_def(&server, ServerAutonomy::Passive));
    client.start_all().await;

    let resource = next_matching(&mut rx, |e| match e {
        ClientEvent::RunJob(job) => panic!("passive server ran job {}", job.id()),
        ClientEvent::InsufficientAutonomyForJob { resource, .. } => Some(resource),
        _ => None,
    })
    .await;
    assert_eq!(resource.id, "listing");
    assert!(log.contains("passive mode"));
    client.stop_all();
}

#[tokio::test]
async fn test_refetch_request_reloads_resources() {
    let server = MockServer::start().await;
    mount_resources(&server, 2).await;
    mount_jobs(&server, json!({ "jobs": [], "refetch": ["resources"] })).await;

    let (client, mut rx, log) = client(config());
    client.add_server(server_def(&server, ServerAutonomy::Active));
    client.start_all().await;

    for _ in 0..2 {
        next_matching(&mut rx, |e| {
            matches!(e, ClientEvent::UpdatedResources { .. }).then_some(())
        })
        .await;
    }
    assert!(log.contains("requested a refetch"));
    client.stop_all();
}

#[tokio::test]
async fn test_restart_within_interval_is_rate_limited() {
    let server = MockServer::start().await;
    mount_resources(&server, 1).await;
    mount_jobs(&server, json!({ "jobs": [] })).await;

    let (client, mut rx, _log) = client(config());
    client.add_server(server_def(&server, ServerAutonomy::Active));
    client.start_all().await;
    next_matching(&mut rx, |e| {
        matches!(e, ClientEvent::UpdatedResources { .. }).then_some(())
    })
    .await;

    client.stop("coord");
    client.start("coord").await.unwrap();
    let last_fetch = next_matching(&mut rx, |e| match e {
        ClientEvent::ResourceRateLimit { last_fetch, .. } => Some(last_fetch),
        ClientEvent::UpdatedResources { .. } => panic!("refresh was not rate limited"),
        _ => None,
    })
    .await;
    assert!(last_fetch <= Utc::now());
    client.stop_all();
}

#[tokio::test]
async fn test_expired_job_is_dropped() {
    let server = MockServer::start().await;
    mount_resources(&server, 1).await;
    mount_jobs(
        &server,
        json!({ "jobs": [job("stale", ChronoDuration::minutes(-1)), job("fresh", ChronoDuration::minutes(5))] }),
    )
    .await;

    let (client, mut rx, log) = client(config());
    client.add_server(server_def(&server, ServerAutonomy::Active));
    client.start_all().await;

    let job = next_matching(&mut rx, |e| match e {
        ClientEvent::RunJob(job) => Some(job),
        _ => None,
    })
    .await;
    assert_eq!(job.id(), "fresh");
    assert!(log.contains("Dropping expired job stale"));
    client.stop_all();
}

#[tokio::test]
async fn test_unknown_resource_triggers_refresh() {
    let server = MockServer::start().await;
    mount_resources(&server, 1).await;
    let mut unknown = job("job-1", ChronoDuration::minutes(5));
    unknown["resource_id"] = json!("gone");
    mount_jobs(&server, json!({ "jobs": [unknown] })).await;

    let (client, mut rx, log) = client(config());
    client.add_server(server_def(&server, ServerAutonomy::Active));
    client.start_all().await;

    // The follow-up refresh falls inside the refresh interval.
    next_matching(&mut rx, |e| match e {
        ClientEvent::RunJob(_) => panic!("job for an unknown resource was dispatched"),
        ClientEvent::ResourceRateLimit { .. } => Some(()),
        _ => None,
    })
    .await;
    assert!(log.contains("Could not find resource gone"));
    client.stop_all();
}

#[tokio::test]
async fn test_repeated_poll_errors_pause_the_server() {
    let server = MockServer::start().await;
    mount_resources(&server, 1).await;
    Mock::given(method("GET"))
        .and(path("/worker/jobs"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let (client, _rx, log) = client(ClientConfig {
        poll_interval: Duration::from_millis(50),
        ..config()
    });
    client.add_server(server_def(&server, ServerAutonomy::Active));
    client.start_all().await;

    wait_until(|| client.server_status("coord") == Some(ServerStatus::Paused)).await;
    assert_eq!(client.error_count("coord"), Some(3));
    assert!(log.contains("Pausing server Local coordinator"));

    // Paused servers stay quiet until the backoff elapses.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(client.error_count("coord"), Some(3));

    client.stop_all();
    assert_eq!(client.server_status("coord"), Some(ServerStatus::Idle));
}

#[tokio::test]
async fn test_paused_server_resumes_after_backoff() {
    let server = MockServer::start().await;
    // The restart refresh falls inside the refresh interval.
    mount_resources(&server, 1).await;
    Mock::given(method("GET"))
        .and(path("/worker/jobs"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    mount_jobs(&server, json!({ "jobs": [job("job-1", ChronoDuration::minutes(5))] })).await;

    let (client, mut rx, log) = client(ClientConfig {
        pause_threshold: 1,
        backoff_unit: Duration::from_millis(100),
        ..config()
    });
    client.add_server(server_def(&server, ServerAutonomy::Active));
    client.start_all().await;

    assert_eq!(client.error_count("coord"), Some(1));
    assert!(log.contains("Pausing server Local coordinator"));

    let job = next_matching(&mut rx, |e| match e {
        ClientEvent::RunJob(job) => Some(job),
        _ => None,
    })
    .await;
    assert_eq!(job.id(), "job-1");
    assert!(log.contains("Restarting polling of Local coordinator"));
    assert_eq!(client.server_status("coord"), Some(ServerStatus::Polling));
    assert_eq!(client.error_count("coord"), Some(1));

    client.stop_all();
    assert_eq!(client.server_status("coord"), Some(ServerStatus::Idle));
}

#[tokio::test]
async fn test_submit_sends_resource_hash() {
    let server = MockServer::start().await;
    mount_resources(&server, 1).await;
    mount_jobs(&server, json!({ "jobs": [] })).await;
    Mock::given(method("POST"))
        .and(path("/worker/jobs"))
        .and(header("if-match", "listing-hash"))
        .and(header("authorization", "secret-token"))
        .and(header_exists("idempotency-key"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let (client, mut rx, log) = client(config());
    client.add_server(server_def(&server, ServerAutonomy::Active));
    client.start_all().await;
    next_matching(&mut rx, |e| matches!(e, ClientEvent::Polled { .. }).then_some(())).await;

    client.submit_page(page()).await;
    assert!(log.contains("Successfully submitted (passive) job listing"));

    let requests = server.received_requests().await.unwrap_or_default();
    let submitted = requests
        .iter()
        .find(|r| r.method.as_str() == "POST")
        .expect("no submission");
    let body: Value = serde_json::from_slice(&submitted.body).unwrap();
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["resource_id"], json!("listing"));
    assert_eq!(body["payload"]["title"], json!("Emlak"));
    client.stop_all();
}

#[tokio::test]
async fn test_precondition_failure_refreshes_and_retries() {
    let server = MockServer::start().await;
    mount_resources(&server, 2).await;
    mount_jobs(&server, json!({ "jobs": [] })).await;
    Mock::given(method("POST"))
        .and(path("/worker/jobs"))
        .respond_with(ResponseTemplate::new(412))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/worker/jobs"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let (client, mut rx, log) = client(config());
    client.add_server(server_def(&server, ServerAutonomy::Active));
    client.start_all().await;
    next_matching(&mut rx, |e| matches!(e, ClientEvent::Polled { .. }).then_some(())).await;

    client
        .submit_failure("listing", JobSource::Active { id: "job-1".into() }, "Timed out")
        .await;
    assert!(log.contains("Trying to refresh and re-submit"));
    assert!(log.contains("Successfully submitted (active) job listing"));
    assert_eq!(client.error_count("coord"), Some(0));
    client.stop_all();
}

#[tokio::test]
async fn test_exhausted_preconditions_pause_and_drop_later_submissions() {
    let server = MockServer::start().await;
    // Initial load plus one forced refresh per retried attempt.
    mount_resources(&server, 3).await;
    mount_jobs(&server, json!({ "jobs": [] })).await;
    Mock::given(method("POST"))
        .and(path("/worker/jobs"))
        .respond_with(ResponseTemplate::new(412))
        .expect(3)
        .mount(&server)
        .await;

    let (client, mut rx, log) = client(config());
    client.add_server(server_def(&server, ServerAutonomy::Active));
    client.start_all().await;
    next_matching(&mut rx, |e| matches!(e, ClientEvent::Polled { .. }).then_some(())).await;

    client.submit_page(page()).await;
    assert_eq!(client.server_status("coord"), Some(ServerStatus::Paused));
    assert_eq!(client.error_count("coord"), Some(1));
    assert!(log.contains("giving up and pausing"));

    client.submit_page(page()).await;
    assert!(log.contains("Dropping submission for listing"));
    client.stop_all();
}

#[tokio::test]
async fn test_rejected_submission_is_logged() {
    let server = MockServer::start().await;
    mount_resources(&server, 1).await;
    mount_jobs(&server, json!({ "jobs": [] })).await;
    Mock::given(method("POST"))
        .and(path("/worker/jobs"))
        .respond_with(ResponseTemplate::new(422).set_body_string("x".repeat(5000)))
        .expect(1)
        .mount(&server)
        .await;

    let (client, mut rx, log) = client(config());
    client.add_server(server_def(&server, ServerAutonomy::Active));
    client.start_all().await;
    next_matching(&mut rx, |e| matches!(e, ClientEvent::Polled { .. }).then_some(())).await;

    client.submit_page(page()).await;
    let record = log
        .records()
        .into_iter()
        .find(|r| r.text.contains("Failed to submit job"))
        .expect("rejection was not logged");
    let data = record.data.expect("rejection carries data");
    assert_eq!(data["status"], json!(422));
    assert!(data["response"].as_str().unwrap().len() < 5000);
    assert_eq!(client.server_status("coord"), Some(ServerStatus::Polling));
    client.stop_all();
}

#[tokio::test]
async fn test_update_unknown_server_is_an_error() {
    let server = MockServer::start().await;
    let (client, _rx, log) = client(config());
    assert!(client.update_server(server_def(&server, ServerAutonomy::Active)).is_err());
    assert_eq!(log.count(Severity::Error), 1);

    client.add_server(server_def(&server, ServerAutonomy::Active));
    let mut renamed = server_def(&server, ServerAutonomy::Passive);
    renamed.name = "Renamed".into();
    client.update_server(renamed).unwrap();
    assert_eq!(client.servers()[0].name, "Renamed");
    assert_eq!(client.servers()[0].autonomy, ServerAutonomy::Passive);
}
