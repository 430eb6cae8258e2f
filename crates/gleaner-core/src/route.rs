//! Route templates (`/:category/:region`) compiled to anchored regexes, and
//! variable extraction from a location.

use regex::Regex;
use url::Url;

use crate::error::AppError;
use crate::resource::{Resource, VariableKind, Variables};

const SEGMENT: &str = "[a-zA-Z0-9_-]+";

/// A compiled `url_pattern`.
#[derive(Debug, Clone)]
pub struct RoutePattern {
    regex: Regex,
}

impl RoutePattern {
    /// Compile a route template. Every `:name` becomes a named capture group
    /// matching one path segment; everything else is kept as regex syntax.
    pub fn compile(pattern: &str) -> Result<Self, AppError> {
        let placeholder = Regex::new(r":([a-zA-Z0-9_-]+)").map_err(|e| invalid(pattern, e))?;
        let expanded = placeholder.replace_all(normalize_path(pattern), |caps: &regex::Captures| {
            format!("(?P<{}>{SEGMENT})", &caps[1])
        });
        let regex = Regex::new(&format!("^{expanded}$")).map_err(|e| invalid(pattern, e))?;
        Ok(Self { regex })
    }

    /// Returns true if the (normalized) path matches.
    pub fn is_match(&self, path: &str) -> bool {
        self.regex.is_match(normalize_path(path))
    }

    /// Named captures of the normalized path, or `None` on mismatch.
    ///
    /// Groups that exist in the pattern but did not participate in the match
    /// map to `None`.
    pub fn captures(&self, path: &str) -> Option<Vec<(String, Option<String>)>> {
        let caps = self.regex.captures(normalize_path(path))?;
        Some(
            self.regex
                .capture_names()
                .flatten()
                .map(|name| {
                    let value = caps.name(name).map(|m| m.as_str().to_string());
                    (name.to_string(), value)
                })
                .collect(),
        )
    }
}

fn invalid(pattern: &str, err: regex::Error) -> AppError {
    AppError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: err.to_string(),
    }
}

/// Strip a single trailing slash.
pub fn normalize_path(path: &str) -> &str {
    path.strip_suffix('/').unwrap_or(path)
}

/// `https://` origin for a resource hostname, ignoring a leading dot.
pub fn origin_url(hostname: &str) -> String {
    format!("https://{}", hostname.trim_start_matches('.'))
}

/// Read the resource's declared variables from a location.
///
/// Returns `Ok(None)` when the path does not satisfy the resource's pattern.
/// Query variables without a value or default resolve to `null`, and so do
/// URL variables whose capture group did not take part in the match.
pub fn parse_variables(resource: &Resource, url: &Url) -> Result<Option<Variables>, AppError> {
    let pattern = RoutePattern::compile(&resource.url_pattern)?;
    let Some(groups) = pattern.captures(url.path()) else {
        return Ok(None);
    };

    let mut variables = Variables::new();

    for definition in resource
        .variables
        .iter()
        .filter(|v| v.kind == VariableKind::Query)
    {
        let value = url
            .query_pairs()
            .find(|(name, _)| name == definition.identifier.as_str())
            .map(|(_, value)| value.into_owned())
            .or_else(|| definition.default.clone());
        variables.insert(
            definition.output_name().to_string(),
            value.map_or(serde_json::Value::Null, serde_json::Value::String),
        );
    }

    for definition in resource.variables.iter().filter(|v| v.kind == VariableKind::Url) {
        let Some((_, captured)) = groups.iter().find(|(name, _)| *name == definition.identifier)
        else {
            continue;
        };
        variables.insert(
            definition.output_name().to_string(),
            captured
                .clone()
                .map_or(serde_json::Value::Null, serde_json::Value::String),
        );
    }

    Ok(Some(variables))
}
