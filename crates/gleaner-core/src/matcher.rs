//! Decides which resource, if any, applies to the current page.

use std::fmt;

use scraper::Html;
use serde::Serialize;
use url::Url;

use crate::detection::{WellKnownResponse, detect_well_known_response};
use crate::error::AppError;
use crate::resource::{Resource, Variables};
use crate::route::parse_variables;

/// The page being examined: its location and parsed document.
#[derive(Debug, Clone)]
pub struct PageDocument {
    pub url: Url,
    pub html: Html,
}

impl PageDocument {
    pub fn new(url: Url, html: Html) -> Self {
        Self { url, html }
    }

    /// Parse a serialized document fetched from `url`.
    pub fn from_html(url: Url, html: &str) -> Self {
        Self::new(url, Html::parse_document(html))
    }

    /// Parse a location and serialized document.
    pub fn parse(url: &str, html: &str) -> Result<Self, AppError> {
        let url = Url::parse(url)
            .map_err(|e| AppError::Generic(format!("Invalid page url {url}: {e}")))?;
        Ok(Self {
            url,
            html: Html::parse_document(html),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchedResource {
    pub resource: Resource,
    pub variables: Variables,
}

/// Why a page did not match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "response", rename_all = "kebab-case")]
pub enum NoMatch {
    NoMatchingResource,
    WellKnownResponse(WellKnownResponse),
    /// The location has no host, e.g. `about:blank`.
    NotFound,
}

impl fmt::Display for NoMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoMatch::NoMatchingResource => f.write_str("no matching resource"),
            NoMatch::WellKnownResponse(WellKnownResponse::Cloudflare) => {
                f.write_str("well-known response: cloudflare")
            }
            NoMatch::NotFound => f.write_str("not found"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PageCheck {
    Match(MatchedResource),
    Fail(NoMatch),
}

impl PageCheck {
    pub fn matched(self) -> Option<MatchedResource> {
        match self {
            PageCheck::Match(m) => Some(m),
            PageCheck::Fail(_) => None,
        }
    }
}

/// Matches one document at a time against a set of resources. Reused across
/// navigations via [`PageMatcher::update_document`].
#[derive(Debug, Clone)]
pub struct PageMatcher {
    document: PageDocument,
    resources: Vec<Resource>,
}

impl PageMatcher {
    pub fn new(document: PageDocument, resources: Vec<Resource>) -> Self {
        Self {
            document,
            resources,
        }
    }

    pub fn update_document(&mut self, document: PageDocument) {
        self.document = document;
    }

    pub fn update_resources(&mut self, resources: Vec<Resource>) {
        self.resources = resources;
    }

    pub fn document(&self) -> &PageDocument {
        &self.document
    }

    /// Find the first enabled resource whose hostname equals the page host
    /// and whose route pattern matches the path.
    pub fn check_current_page(&self) -> PageCheck {
        let Some(host) = self.document.url.host_str() else {
            return PageCheck::Fail(NoMatch::NotFound);
        };

        if let Some(response) = detect_well_known_response(&self.document.html) {
            tracing::debug!(url = %self.document.url, ?response, "Well-known response detected");
            return PageCheck::Fail(NoMatch::WellKnownResponse(response));
        }

        for resource in self
            .resources
            .iter()
            .filter(|r| !r.disabled && r.hostname == host)
        {
            match parse_variables(resource, &self.document.url) {
                Ok(Some(variables)) => {
                    return PageCheck::Match(MatchedResource {
                        resource: resource.clone(),
                        variables,
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(resource_id = %resource.id, error = %e, "Skipping resource");
                }
            }
        }

        PageCheck::Fail(NoMatch::NoMatchingResource)
    }
}
