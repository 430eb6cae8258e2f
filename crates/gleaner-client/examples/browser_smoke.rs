/// Smoke test for `BrowserFetcher`.
///
/// Opens <https://example.com> in headless Chromium, waits for its `<h1>`
/// and runs a one-field resource over the rendered page.
///
/// Run with:
///   cargo run -p gleaner-client --example browser_smoke --features browser
use gleaner_client::BrowserFetcher;
use gleaner_core::interpreter::{Interpreter, LoadWait};
use gleaner_core::resource::Resource;
use serde_json::json;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let resource: Resource = serde_json::from_value(json!({
        "id": "example-domain",
        "hostname": "example.com",
        "url_pattern": "/",
        "hash": "smoke",
        "wait_for": ["h1"],
        "descriptors": [{
            "kind": "selector:node",
            "selector": "h1",
            "extractors": [{"kind": "extractor:text", "key": "title"}]
        }]
    }))?;

    println!("Launching headless browser…");
    let fetcher = BrowserFetcher::new().await?;
    let page = fetcher.open("https://example.com").await?;

    let mut interpreter = Interpreter::new(&resource);
    let payload = interpreter.parse_async(&page, LoadWait::default()).await?;
    page.close().await;

    assert_eq!(
        payload.get("title").and_then(|v| v.as_str()),
        Some("Example Domain"),
        "unexpected payload {payload:?}"
    );
    println!("OK: {}", serde_json::Value::Object(payload));
    for warning in interpreter.warnings() {
        println!("warning: {warning}");
    }
    Ok(())
}
