//! Runs a resource's descriptors against a document to build a payload.
//!
//! Evaluation starts with the `meta` selectors (document scope) to find the
//! page locale, then walks `descriptors` with the `<body>` element as
//! context. Node selectors write extractor values into a local object that is
//! shallow-merged into the parent; array selectors produce one record per
//! matched element under their `key`, taken literally (dots do not nest).
//! A `recovery:bail` anywhere, meta included, empties the whole payload.

use std::time::Duration;

use scraper::{ElementRef, Html, Selector as CssSelector};
use serde_json::Value;

use crate::error::AppError;
use crate::locale::NumberParser;
use crate::resource::{
    ArraySelector, Extractor, NodeSelector, Payload, Recovery, Resource, Selector,
};
use crate::text::normalized_text;
use crate::traits::{InlineStyleResolver, LiveDocument, StyleResolver};
use crate::transform::{TransformContext, apply_all};

/// Polling parameters for [`wait_for_load`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadWait {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for LoadWait {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadReadiness {
    /// Number of failed checks before the document was ready. Zero means it
    /// was ready on the first check.
    pub ready_after_tries: u32,
}

/// Poll `document` until one of the resource's `wait_for` selectors matches.
///
/// Fails with [`AppError::Timeout`] once `wait.timeout` elapses; the polling
/// future is dropped at that point.
pub async fn wait_for_load<D>(
    document: &D,
    resource: &Resource,
    wait: LoadWait,
) -> Result<LoadReadiness, AppError>
where
    D: LiveDocument + ?Sized,
{
    let selectors = resource
        .wait_for
        .iter()
        .flatten()
        .map(|s| parse_selector(s))
        .collect::<Result<Vec<_>, _>>()?;
    if selectors.is_empty() {
        return Ok(LoadReadiness {
            ready_after_tries: 0,
        });
    }

    let poll = async {
        let mut tries = 0u32;
        loop {
            let snapshot = document.snapshot().await?;
            let ready = {
                let html = Html::parse_document(&snapshot);
                selectors.iter().any(|s| html.select(s).next().is_some())
            };
            if ready {
                return Ok::<_, AppError>(LoadReadiness {
                    ready_after_tries: tries,
                });
            }
            tries += 1;
            tokio::time::sleep(wait.interval).await;
        }
    };

    tokio::time::timeout(wait.timeout, poll)
        .await
        .map_err(|_| AppError::Timeout(wait.timeout))?
}

fn parse_selector(selector: &str) -> Result<CssSelector, AppError> {
    CssSelector::parse(selector).map_err(|e| AppError::InvalidSelector {
        selector: selector.to_string(),
        reason: format!("{e:?}"),
    })
}

/// Interprets one resource. Reusable across documents; warnings are reset
/// at the start of every parse.
pub struct Interpreter<'r, S: StyleResolver = InlineStyleResolver> {
    resource: &'r Resource,
    styles: S,
    warnings: Vec<String>,
}

impl<'r> Interpreter<'r> {
    pub fn new(resource: &'r Resource) -> Self {
        Self::with_styles(resource, InlineStyleResolver)
    }
}

impl<'r, S: StyleResolver> Interpreter<'r, S> {
    pub fn with_styles(resource: &'r Resource, styles: S) -> Self {
        Self {
            resource,
            styles,
            warnings: Vec::new(),
        }
    }

    pub fn resource(&self) -> &Resource {
        self.resource
    }

    /// Warnings recorded by the last parse.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    /// Extract the payload from a parsed document.
    pub fn parse(&mut self, html: &Html) -> Result<Payload, AppError> {
        self.warnings.clear();
        self.run(html)
    }

    /// Wait for the resource's load condition, then parse the latest
    /// snapshot. A timed-out wait is recorded as a warning, not an error.
    pub async fn parse_async<D>(&mut self, document: &D, wait: LoadWait) -> Result<Payload, AppError>
    where
        D: LiveDocument + ?Sized,
    {
        self.warnings.clear();

        if self.resource.has_wait_condition() {
            match wait_for_load(document, self.resource, wait).await {
                Ok(LoadReadiness {
                    ready_after_tries: 0,
                }) => self
                    .warnings
                    .push("Page was already loaded before waiting for it".into()),
                Ok(_) => {}
                Err(AppError::Timeout(after)) => self.warnings.push(format!(
                    "Page did not finish loading within {}ms",
                    after.as_millis()
                )),
                Err(e) => return Err(e),
            }
        }

        let snapshot = document.snapshot().await?;
        let html = Html::parse_document(&snapshot);
        self.run(&html)
    }

    fn run(&mut self, html: &Html) -> Result<Payload, AppError> {
        let body_selector = parse_selector("body")?;
        let body = html
            .select(&body_selector)
            .next()
            .unwrap_or_else(|| html.root_element());

        let mut pass = Pass {
            hostname: &self.resource.hostname,
            styles: &self.styles,
            numbers: NumberParser::default(),
            warnings: &mut self.warnings,
            body,
        };

        let mut meta = Payload::new();
        for selector in &self.resource.meta {
            match pass.node(selector, Scope::Document(html)) {
                Ok(values) => meta.extend(values),
                Err(Abort::Bail) => {
                    tracing::debug!(resource_id = %self.resource.id, "Extraction bailed in meta");
                    return Ok(Payload::new());
                }
                Err(Abort::Failed(e)) => return Err(e),
            }
        }
        if let Some(Value::String(locale)) = meta.get("locale") {
            pass.numbers = NumberParser::new(locale);
        }

        let mut payload = Payload::new();
        for descriptor in &self.resource.descriptors {
            match pass.selector(descriptor, Scope::Element(body)) {
                Ok(values) => payload.extend(values),
                Err(Abort::Bail) => {
                    tracing::debug!(resource_id = %self.resource.id, "Extraction bailed");
                    return Ok(Payload::new());
                }
                Err(Abort::Failed(e)) => return Err(e),
            }
        }
        Ok(payload)
    }
}

enum Abort {
    /// A bail recovery fired; the whole pass yields an empty payload.
    Bail,
    Failed(AppError),
}

impl From<AppError> for Abort {
    fn from(e: AppError) -> Self {
        Abort::Failed(e)
    }
}

#[derive(Clone, Copy)]
enum Scope<'h> {
    Document(&'h Html),
    Element(ElementRef<'h>),
}

impl<'h> Scope<'h> {
    fn element(self) -> ElementRef<'h> {
        match self {
            Scope::Document(html) => html.root_element(),
            Scope::Element(element) => element,
        }
    }

    fn first(self, selector: &CssSelector) -> Option<ElementRef<'h>> {
        match self {
            Scope::Document(html) => html.select(selector).next(),
            Scope::Element(element) => element.select(selector).next(),
        }
    }

    fn all(self, selector: &CssSelector) -> Vec<ElementRef<'h>> {
        match self {
            Scope::Document(html) => html.select(selector).collect(),
            Scope::Element(element) => element.select(selector).collect(),
        }
    }
}

struct Pass<'a, 'h, S> {
    hostname: &'a str,
    styles: &'a S,
    numbers: NumberParser,
    warnings: &'a mut Vec<String>,
    body: ElementRef<'h>,
}

impl<'h, S: StyleResolver> Pass<'_, 'h, S> {
    fn selector(&mut self, selector: &Selector, scope: Scope<'h>) -> Result<Payload, Abort> {
        match selector {
            Selector::Node(node) => self.node(node, scope),
            Selector::Array(array) => self.array(array, scope),
        }
    }

    fn node(&mut self, node: &NodeSelector, scope: Scope<'h>) -> Result<Payload, Abort> {
        let target = match &node.selector {
            None => Some(scope.element()),
            Some(css) => scope.first(&parse_selector(css)?),
        };

        let Some(element) = target else {
            return self.recover(node);
        };

        let mut out = Payload::new();
        for extractor in &node.extractors {
            let value = self.extract(extractor, element)?;
            insert_path(&mut out, extractor.key(), value);
        }
        Ok(out)
    }

    fn recover(&mut self, node: &NodeSelector) -> Result<Payload, Abort> {
        match &node.if_missing {
            None => Err(Abort::Failed(AppError::MissingNode {
                selector: node.selector.clone().unwrap_or_default(),
            })),
            Some(Recovery::Bail { warning }) => {
                self.warnings.extend(warning.clone());
                Err(Abort::Bail)
            }
            Some(Recovery::Omit { warning }) => {
                self.warnings.extend(warning.clone());
                Ok(Payload::new())
            }
            Some(Recovery::Fallback { selector }) => {
                self.selector(selector, Scope::Element(self.body))
            }
        }
    }

    fn array(&mut self, array: &ArraySelector, scope: Scope<'h>) -> Result<Payload, Abort> {
        let css = parse_selector(&array.selector)?;
        let mut records = Vec::new();
        for element in scope.all(&css) {
            let mut record = Payload::new();
            for field in &array.fields {
                record.extend(self.selector(field, Scope::Element(element))?);
            }
            records.push(Value::Object(record));
        }

        let mut out = Payload::new();
        out.insert(array.key.clone(), Value::Array(records));
        Ok(out)
    }

    fn extract(&mut self, extractor: &Extractor, element: ElementRef<'h>) -> Result<Value, AppError> {
        let raw = match extractor {
            Extractor::Text { .. } => Value::String(normalized_text(element)),
            Extractor::Attribute { attribute, .. } => element
                .value()
                .attr(attribute)
                .map_or(Value::Null, |v| Value::String(v.to_string())),
            Extractor::Style {
                declaration,
                pseudo,
                ..
            } => match self.styles.computed_style(&element, pseudo.as_deref()) {
                Some(style) => style
                    .get(declaration)
                    .map_or(Value::Null, |v| Value::String(v.to_string())),
                None => {
                    self.warnings.push(format!(
                        "Computed style is not available for {declaration}"
                    ));
                    Value::Null
                }
            },
        };

        let mut ctx = TransformContext {
            hostname: self.hostname,
            numbers: &self.numbers,
            warnings: &mut *self.warnings,
        };
        apply_all(raw, extractor.transformers(), &mut ctx)
    }
}

/// Write `value` under a dot-separated key, creating intermediate objects.
fn insert_path(target: &mut Payload, key: &str, value: Value) {
    let mut parts = key.split('.').peekable();
    let mut current = target;
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            current.insert(part.to_string(), value);
            return;
        }
        let slot = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Payload::new()));
        if !slot.is_object() {
            *slot = Value::Object(Payload::new());
        }
        let Value::Object(next) = slot else {
            return;
        };
        current = next;
    }
}
