//! Declarative resource schemas published by a coordinator.
//!
//! A [`Resource`] describes one scrapable site: which pages it applies to
//! (`hostname` + `url_pattern`), which variables to read from the location,
//! and how to walk the document to build a payload (`descriptors`).
//!
//! The JSON shape matches the coordinator's wire format, including the
//! `kind` tags (`selector:node`, `extractor:text`, `transformer:cast`, …).

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Extracted data: a JSON object built from extractor keys.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Variables read from the route and query string of a location.
pub type Variables = serde_json::Map<String, serde_json::Value>;

/// A scrapable site definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Opaque identifier, unique for the coordinator that defines it.
    pub id: String,
    /// Exact hostname pages must have (subdomains are significant).
    pub hostname: String,
    /// Route template such as `/:category/:region`.
    pub url_pattern: String,
    #[serde(default)]
    pub variables: Vec<VariableDefinition>,
    /// Selectors run once against the document root to derive parsing
    /// context. Only `locale` is interpreted.
    #[serde(default)]
    pub meta: Vec<NodeSelector>,
    /// CSS selectors; the page counts as loaded once any of them matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_for: Option<Vec<String>>,
    #[serde(default)]
    pub descriptors: Vec<Selector>,
    /// Schema version token sent as `If-Match` on submission.
    pub hash: String,
    #[serde(default)]
    pub disabled: bool,
}

impl Resource {
    /// Returns true when a load wait is configured.
    pub fn has_wait_condition(&self) -> bool {
        self.wait_for.as_ref().is_some_and(|w| !w.is_empty())
    }
}

/// A rule locating one node or a list of nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Selector {
    #[serde(rename = "selector:node")]
    Node(NodeSelector),
    #[serde(rename = "selector:array")]
    Array(ArraySelector),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSelector {
    /// `None` means the current context node.
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub extractors: Vec<Extractor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_missing: Option<Recovery>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArraySelector {
    pub key: String,
    pub selector: String,
    #[serde(default)]
    pub fields: Vec<Selector>,
}

/// Reads one value from a located node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Extractor {
    #[serde(rename = "extractor:text")]
    Text {
        key: String,
        #[serde(default)]
        transformers: Vec<Transformer>,
    },
    #[serde(rename = "extractor:attribute")]
    Attribute {
        key: String,
        attribute: String,
        #[serde(default)]
        transformers: Vec<Transformer>,
    },
    #[serde(rename = "extractor:style")]
    Style {
        key: String,
        declaration: String,
        #[serde(default)]
        pseudo: Option<String>,
        #[serde(default)]
        transformers: Vec<Transformer>,
    },
}

impl Extractor {
    /// Dot-separated destination key.
    pub fn key(&self) -> &str {
        match self {
            Extractor::Text { key, .. }
            | Extractor::Attribute { key, .. }
            | Extractor::Style { key, .. } => key,
        }
    }

    pub fn transformers(&self) -> &[Transformer] {
        match self {
            Extractor::Text { transformers, .. }
            | Extractor::Attribute { transformers, .. }
            | Extractor::Style { transformers, .. } => transformers,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Transformer {
    #[serde(rename = "transformer:regex")]
    Regex {
        regex: String,
        #[serde(default)]
        replacement: Option<String>,
    },
    #[serde(rename = "transformer:cast")]
    Cast {
        #[serde(rename = "type")]
        target: CastTarget,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        options: Option<CastOptions>,
    },
    #[serde(rename = "transformer:fallback")]
    Fallback { value: String },
    #[serde(rename = "transformer:trim")]
    Trim { options: Vec<TrimOption> },
    /// Any kind this client does not know. Applying it is a no-op.
    #[serde(other)]
    Unrecognized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CastTarget {
    Number,
    Url,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CastOptions {
    /// Overrides the page locale for `number` casts.
    #[serde(default)]
    pub force_locale: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrimOption {
    /// Collapse runs of spaces and whitespace around newlines.
    Inside,
    /// Trim both ends.
    Outside,
}

/// Policy applied when a node selector's target is absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Recovery {
    #[serde(rename = "recovery:bail")]
    Bail {
        #[serde(default)]
        warning: Option<String>,
    },
    #[serde(rename = "recovery:omit")]
    Omit {
        #[serde(default)]
        warning: Option<String>,
    },
    #[serde(rename = "recovery:fallback")]
    Fallback { selector: Box<Selector> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableKind {
    Url,
    Query,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDefinition {
    pub kind: VariableKind,
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

impl VariableDefinition {
    /// Output name: the alias when present, the identifier otherwise.
    pub fn output_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.identifier)
    }
}

/// Body of `GET /resources`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcesResponse {
    pub name: String,
    pub resources: Vec<Resource>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ResourceFile {
    Response(ResourcesResponse),
    List(Vec<Resource>),
}

/// Load resources from a JSON file holding either a bare array or a full
/// `GET /resources` response body.
pub fn load_resources(path: &Path) -> Result<Vec<Resource>, AppError> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        AppError::ConfigError(format!(
            "Failed to read resource file {}: {e}",
            path.display()
        ))
    })?;
    parse_resources(&raw)
}

/// Parse the JSON accepted by [`load_resources`].
pub fn parse_resources(raw: &str) -> Result<Vec<Resource>, AppError> {
    let file: ResourceFile = serde_json::from_str(raw)?;
    Ok(match file {
        ResourceFile::Response(response) => response.resources,
        ResourceFile::List(resources) => resources,
    })
}
