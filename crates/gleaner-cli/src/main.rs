use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio_util::task::TaskTracker;
use tracing_subscriber::EnvFilter;
use url::Url;

use gleaner_client::{ClientConfig, ClientEvent, JobExecutor, ReqwestFetcher, SyncClient};
use gleaner_core::job::{JobSource, ScrapedPage, ServerAutonomy, ServerDefinition};
use gleaner_core::matcher::{PageCheck, PageDocument, PageMatcher};
use gleaner_core::page::process_page;
use gleaner_core::resource::{Resource, load_resources};
use gleaner_core::traits::{Fetcher, StaticAllowList, TracingLogSink};

#[derive(Parser)]
#[command(name = "gleaner", version, about = "Declarative page extraction worker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract one page with a set of resource definitions and print the result
    Extract {
        /// Page URL, used for matching even when --html is given
        #[arg(short, long)]
        url: String,

        /// JSON file with a resource array or a full /resources response
        #[arg(short, long)]
        resources: PathBuf,

        /// Read the page from this file instead of fetching it
        #[arg(long)]
        html: Option<PathBuf>,

        /// Allow fetching private and loopback addresses
        #[arg(long, default_value_t = false)]
        allow_private: bool,

        /// Render the page in headless Chromium and honour `wait_for`
        #[cfg(feature = "browser")]
        #[arg(long, default_value_t = false, conflicts_with = "html")]
        browser: bool,
    },

    /// Poll a coordinator for jobs, execute them and submit the results
    Run {
        /// Base URL of the coordinator API
        #[arg(long, env = "GLEANER_SERVER_URL")]
        server_url: String,

        /// Token sent in the Authorization header
        #[arg(long, env = "GLEANER_TOKEN")]
        token: String,

        /// "active" executes jobs, "passive" only reports them
        #[arg(long, env = "GLEANER_AUTONOMY", default_value = "active", value_parser = parse_autonomy)]
        autonomy: ServerAutonomy,

        /// Display name of the coordinator
        #[arg(long, default_value = "coordinator")]
        name: String,

        /// Resource ids to request jobs for (repeatable)
        #[arg(short, long = "resource", required = true)]
        resources: Vec<String>,

        /// Allow job URLs on private and loopback addresses
        #[arg(long, default_value_t = false)]
        allow_private: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("gleaner=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        #[cfg(feature = "browser")]
        Commands::Extract {
            url,
            resources,
            browser: true,
            ..
        } => cmd_extract_browser(&url, &resources).await?,
        Commands::Extract {
            url,
            resources,
            html,
            allow_private,
            ..
        } => cmd_extract(&url, &resources, html.as_deref(), allow_private).await?,
        Commands::Run {
            server_url,
            token,
            autonomy,
            name,
            resources,
            allow_private,
        } => {
            let server = ServerDefinition {
                id: server_url.clone(),
                name,
                url: server_url,
                token,
                autonomy,
            };
            cmd_run(server, resources, allow_private).await?;
        }
    }

    Ok(())
}

fn parse_autonomy(raw: &str) -> Result<ServerAutonomy, String> {
    match raw.to_ascii_lowercase().as_str() {
        "active" => Ok(ServerAutonomy::Active),
        "passive" => Ok(ServerAutonomy::Passive),
        other => Err(format!("unknown autonomy '{other}' (expected active or passive)")),
    }
}

fn read_resources(path: &Path) -> Result<Vec<Resource>> {
    let resources = load_resources(path).map_err(|e| anyhow::anyhow!(e))?;
    tracing::info!(count = resources.len(), file = %path.display(), "Loaded resources");
    Ok(resources)
}

/// Match a page against `resources` and extract it.
fn extract_page(url: &str, html: &str, resources: Vec<Resource>) -> Result<ScrapedPage> {
    let document = PageDocument::parse(url, html).map_err(|e| anyhow::anyhow!(e))?;
    let matcher = PageMatcher::new(document, resources);
    match matcher.check_current_page() {
        PageCheck::Match(matched) => {
            tracing::info!(resource_id = %matched.resource.id, "Page matched");
            Ok(process_page(
                matcher.document(),
                matched,
                JobSource::Passive,
            ))
        }
        PageCheck::Fail(reason) => bail!("{url}: {reason}"),
    }
}

async fn cmd_extract(
    url: &str,
    resources_path: &Path,
    html_path: Option<&Path>,
    allow_private: bool,
) -> Result<()> {
    let resources = read_resources(resources_path)?;

    let html = match html_path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read HTML file: {}", path.display()))?,
        None => {
            tracing::info!("Fetching {}", url);
            let mut fetcher = ReqwestFetcher::new().context("Failed to create HTTP client")?;
            if allow_private {
                fetcher = fetcher.allow_private_urls();
            }
            fetcher.fetch(url).await.map_err(|e| anyhow::anyhow!(e))?
        }
    };
    tracing::info!("Read {} bytes of HTML", html.len());

    let page = extract_page(url, &html, resources)?;
    for warning in &page.warnings {
        tracing::warn!(resource_id = %page.resource_id, "{warning}");
    }

    println!("{}", serde_json::to_string_pretty(&page)?);
    Ok(())
}

#[cfg(feature = "browser")]
async fn cmd_extract_browser(url: &str, resources_path: &Path) -> Result<()> {
    use gleaner_client::BrowserFetcher;
    use gleaner_core::interpreter::{Interpreter, LoadWait};
    use gleaner_core::traits::LiveDocument;

    let resources = read_resources(resources_path)?;

    tracing::info!("Rendering {}", url);
    let fetcher = BrowserFetcher::new().await.map_err(|e| anyhow::anyhow!(e))?;
    let live = fetcher.open(url).await.map_err(|e| anyhow::anyhow!(e))?;

    let first = live.snapshot().await.map_err(|e| anyhow::anyhow!(e))?;
    let check = {
        let document = PageDocument::parse(url, &first).map_err(|e| anyhow::anyhow!(e))?;
        PageMatcher::new(document, resources).check_current_page()
    };
    let matched = match check {
        PageCheck::Match(matched) => matched,
        PageCheck::Fail(reason) => {
            live.close().await;
            bail!("{url}: {reason}");
        }
    };

    let mut interpreter = Interpreter::new(&matched.resource);
    let parsed = interpreter.parse_async(&live, LoadWait::default()).await;
    live.close().await;

    let mut warnings = interpreter.take_warnings();
    let payload = parsed.unwrap_or_else(|e| {
        warnings.push(e.to_string());
        Default::default()
    });
    let page = ScrapedPage {
        resource_id: matched.resource.id.clone(),
        payload,
        variables: matched.variables,
        source: JobSource::Passive,
        warnings,
    };

    println!("{}", serde_json::to_string_pretty(&page)?);
    Ok(())
}

async fn cmd_run(server: ServerDefinition, resources: Vec<String>, allow_private: bool) -> Result<()> {
    Url::parse(&server.url).with_context(|| format!("Invalid server URL: {}", server.url))?;

    let config = ClientConfig::from_env().map_err(|e| anyhow::anyhow!(e))?;
    let mut fetcher = ReqwestFetcher::from_config(&config).map_err(|e| anyhow::anyhow!(e))?;
    if allow_private {
        fetcher = fetcher.allow_private_urls();
    }
    let executor = JobExecutor::new(fetcher).with_timeout(config.request_timeout);

    let (client, mut events) =
        SyncClient::new(config, StaticAllowList(resources), TracingLogSink)
            .map_err(|e| anyhow::anyhow!(e))?;
    client.add_server(server);
    client.start_all().await;
    tracing::info!("Worker started, press Ctrl-C to stop");

    let jobs = TaskTracker::new();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    ClientEvent::RunJob(job) => {
                        let client = client.clone();
                        let executor = executor.clone();
                        jobs.spawn(async move {
                            let result = executor.execute(&job).await;
                            client.submit_result(result).await;
                        });
                    }
                    ClientEvent::UpdatedResources { server, resources } => {
                        tracing::info!(server = %server.id, count = resources.len(), "Resources refreshed");
                    }
                    ClientEvent::Polled { server, jobs: polled } => {
                        tracing::debug!(server = %server.id, jobs = polled.len(), "Polled");
                    }
                    ClientEvent::ResourceRateLimit { server, last_fetch } => {
                        tracing::debug!(server = %server.id, %last_fetch, "Resource refresh skipped");
                    }
                    ClientEvent::InsufficientAutonomyForJob { server, resource } => {
                        tracing::warn!(
                            server = %server.id,
                            resource_id = %resource.id,
                            "Job offered but the server is passive"
                        );
                    }
                }
            }
        }
    }

    client.stop_all();
    jobs.close();
    jobs.wait().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_extract() {
        let cli = Cli::try_parse_from([
            "gleaner",
            "extract",
            "--url",
            "https://www.example.com/emlak",
            "--resources",
            "resources.json",
            "--html",
            "page.html",
        ])
        .unwrap();
        match cli.command {
            Commands::Extract {
                url,
                resources,
                html,
                allow_private,
                ..
            } => {
                assert_eq!(url, "https://www.example.com/emlak");
                assert_eq!(resources, PathBuf::from("resources.json"));
                assert_eq!(html, Some(PathBuf::from("page.html")));
                assert!(!allow_private);
            }
            Commands::Run { .. } => panic!("expected extract"),
        }
    }

    #[test]
    fn parses_run_with_repeated_resources() {
        let cli = Cli::try_parse_from([
            "gleaner",
            "run",
            "--server-url",
            "https://coord.test/api",
            "--token",
            "secret",
            "--autonomy",
            "Passive",
            "-r",
            "listing",
            "--resource",
            "detail",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                server_url,
                autonomy,
                name,
                resources,
                ..
            } => {
                assert_eq!(server_url, "https://coord.test/api");
                assert_eq!(autonomy, ServerAutonomy::Passive);
                assert_eq!(name, "coordinator");
                assert_eq!(resources, vec!["listing", "detail"]);
            }
            Commands::Extract { .. } => panic!("expected run"),
        }
    }

    #[test]
    fn run_requires_a_resource_and_a_known_autonomy() {
        let base = [
            "gleaner",
            "run",
            "--server-url",
            "https://coord.test",
            "--token",
            "t",
        ];
        assert!(Cli::try_parse_from(base).is_err());

        let mut args = base.to_vec();
        args.extend(["--resource", "listing", "--autonomy", "aggressive"]);
        assert!(Cli::try_parse_from(args).is_err());
    }

    #[test]
    fn extract_page_matches_and_reports_misses() {
        let resources = vec![gleaner_core::testutil::listing_resource("listing", "www.example.com")];
        let page = extract_page(
            "https://www.example.com/emlak",
            "<h1> Emlak </h1>",
            resources.clone(),
        )
        .unwrap();
        assert_eq!(page.payload["title"], serde_json::json!("Emlak"));
        assert_eq!(page.variables["category"], serde_json::json!("emlak"));

        let err = extract_page("https://other.example.com/emlak", "<h1>x</h1>", resources)
            .unwrap_err();
        assert!(err.to_string().contains("no matching resource"));
    }
}
