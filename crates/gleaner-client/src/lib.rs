pub mod client;
pub mod config;
pub mod executor;
pub mod fetcher;
pub mod protocol;

#[cfg(feature = "browser")]
pub mod browser_fetcher;

pub use client::{ClientEvent, ServerStatus, SyncClient};
pub use config::ClientConfig;
pub use executor::JobExecutor;
pub use fetcher::ReqwestFetcher;

#[cfg(feature = "browser")]
pub use browser_fetcher::{BrowserFetcher, BrowserPage};
