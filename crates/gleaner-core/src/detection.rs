//! Recognition of interstitial pages served instead of the real content.

use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};

/// A response that is known not to be the requested page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WellKnownResponse {
    /// Cloudflare bot challenge or Turnstile page.
    Cloudflare,
}

const CLOUDFLARE_SIGNATURES: &[&str] = &[
    r#"script[src^="https://challenges.cloudflare.com/cdn-cgi/challenge-platform"]"#,
    r#"script[src^="https://challenges.cloudflare.com/turnstile/"]"#,
    r#"script[src^="/cdn-cgi/challenge-platform/"]"#,
];

/// Check a document for a well-known interstitial.
pub fn detect_well_known_response(document: &Html) -> Option<WellKnownResponse> {
    let challenged = CLOUDFLARE_SIGNATURES.iter().any(|signature| {
        Selector::parse(signature)
            .map(|selector| document.select(&selector).next().is_some())
            .unwrap_or(false)
    });
    challenged.then_some(WellKnownResponse::Cloudflare)
}
