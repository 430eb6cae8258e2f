use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use gleaner_core::error::AppError;
use gleaner_core::traits::{Fetcher, LiveDocument};

const CHROME_CANDIDATES: &[&str] = &[
    "/snap/chromium/current/usr/lib/chromium-browser/chrome",
    "/var/lib/flatpak/exports/bin/org.chromium.Chromium",
    "/usr/bin/google-chrome-stable",
    "/usr/bin/google-chrome",
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
];

/// Headless Chromium fetcher for pages that render their content with
/// JavaScript.
///
/// One browser process is shared by all clones. [`Fetcher::fetch`] opens a
/// tab, reads the DOM once `<body>` exists and closes the tab;
/// [`BrowserFetcher::open`] keeps the tab alive as a [`LiveDocument`] so the
/// interpreter can wait for a resource's `wait_for` selectors.
#[derive(Clone)]
pub struct BrowserFetcher {
    browser: Arc<Browser>,
    timeout: Duration,
}

impl BrowserFetcher {
    /// Launch with a 30 s navigation timeout.
    pub async fn new() -> Result<Self, AppError> {
        Self::with_timeout(Duration::from_secs(30)).await
    }

    pub async fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        let mut builder = BrowserConfig::builder().no_sandbox().disable_default_args();
        if let Some(bin) = find_chrome_binary() {
            tracing::info!(binary = %bin.display(), "Using Chrome binary");
            builder = builder.chrome_executable(bin);
        }

        let config = builder
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--no-first-run")
            .build()
            .map_err(|e| AppError::ConfigError(format!("Browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AppError::Generic(format!("Failed to launch browser: {e}")))?;

        // The CDP handler has to be driven for the connection to make progress.
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::warn!(error = %e, "Browser CDP handler error");
                    break;
                }
            }
        });

        Ok(Self {
            browser: Arc::new(browser),
            timeout,
        })
    }

    /// Navigate a new tab to `url` and hand it out as a live document.
    ///
    /// The tab is closed again if navigation fails or times out.
    pub async fn open(&self, url: &str) -> Result<BrowserPage, AppError> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| AppError::HttpError(format!("Failed to open a browser tab: {e}")))?;

        let navigation = async {
            page.goto(url)
                .await
                .map(|_| ())
                .map_err(|e| AppError::HttpError(format!("Failed to navigate to {url}: {e}")))
        };
        let cleanup = BrowserPage { page: page.clone() }.close();
        navigate_or_close(self.timeout, navigation, cleanup).await?;

        Ok(BrowserPage { page })
    }
}

/// Await `navigation` for at most `timeout`. On failure or expiry `cleanup`
/// runs before the error is returned; on success it is dropped unpolled.
async fn navigate_or_close<T>(
    timeout: Duration,
    navigation: impl Future<Output = Result<T, AppError>>,
    cleanup: impl Future<Output = ()>,
) -> Result<T, AppError> {
    let result = tokio::time::timeout(timeout, navigation)
        .await
        .unwrap_or(Err(AppError::Timeout(timeout)));
    if result.is_err() {
        cleanup.await;
    }
    result
}

/// An open browser tab.
pub struct BrowserPage {
    page: Page,
}

impl BrowserPage {
    pub async fn close(self) {
        if let Err(e) = self.page.close().await {
            tracing::debug!(error = %e, "Failed to close browser tab");
        }
    }
}

impl LiveDocument for BrowserPage {
    async fn snapshot(&self) -> Result<String, AppError> {
        self.page
            .content()
            .await
            .map_err(|e| AppError::HttpError(format!("Failed to read page content: {e}")))
    }
}

impl Fetcher for BrowserFetcher {
    async fn fetch(&self, url: &str) -> Result<String, AppError> {
        let page = self.open(url).await?;
        let html = tokio::time::timeout(self.timeout, async {
            page.page
                .find_element("body")
                .await
                .map_err(|e| AppError::HttpError(format!("Page did not render body: {e}")))?;
            page.snapshot().await
        })
        .await
        .unwrap_or(Err(AppError::Timeout(self.timeout)));
        page.close().await;
        html
    }
}

/// Locate a usable Chrome binary. `CHROME_BIN` wins; snap installs are
/// resolved to the real binary because the snap wrapper drops headless
/// flags. `None` lets chromiumoxide search on its own.
fn find_chrome_binary() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os("CHROME_BIN").map(PathBuf::from)
        && path.exists()
    {
        return Some(path);
    }
    CHROME_CANDIDATES
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
}
