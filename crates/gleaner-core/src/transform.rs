//! The transformer chain applied to extracted values.

use regex::Regex;
use serde_json::Value;
use url::Url;

use crate::error::AppError;
use crate::locale::NumberParser;
use crate::resource::{CastOptions, CastTarget, Transformer, TrimOption};
use crate::route::origin_url;

/// State the transformers read from and report into.
pub struct TransformContext<'a> {
    /// Hostname relative URLs are resolved against.
    pub hostname: &'a str,
    /// Parser derived from the page locale.
    pub numbers: &'a NumberParser,
    pub warnings: &'a mut Vec<String>,
}

/// Apply transformers left to right.
pub fn apply_all(
    value: Value,
    transformers: &[Transformer],
    ctx: &mut TransformContext<'_>,
) -> Result<Value, AppError> {
    transformers
        .iter()
        .try_fold(value, |acc, transformer| apply(acc, transformer, ctx))
}

pub fn apply(
    value: Value,
    transformer: &Transformer,
    ctx: &mut TransformContext<'_>,
) -> Result<Value, AppError> {
    match transformer {
        Transformer::Regex { regex, replacement } => {
            regex_transform(value, regex, replacement.as_deref())
        }
        Transformer::Cast { target, options } => cast(value, *target, options.as_ref(), ctx),
        Transformer::Fallback { value: literal } => Ok(if value.is_null() {
            Value::String(literal.clone())
        } else {
            value
        }),
        Transformer::Trim { options } => trim(value, options),
        Transformer::Unrecognized => {
            ctx.warnings
                .push("Invalid transformer kind: unrecognized transformer was ignored".into());
            Ok(value)
        }
    }
}

fn expect_string(value: Value, transformer: &'static str) -> Result<String, AppError> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(AppError::InvalidValue {
            transformer,
            value: other.to_string(),
        }),
    }
}

fn regex_transform(value: Value, pattern: &str, replacement: Option<&str>) -> Result<Value, AppError> {
    let input = expect_string(value, "transformer:regex")?;
    let regex = Regex::new(pattern).map_err(|e| AppError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })?;

    match replacement.filter(|r| !r.is_empty()) {
        Some(replacement) => Ok(Value::String(
            regex.replacen(&input, 1, replacement).into_owned(),
        )),
        None => regex
            .captures(&input)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
            .filter(|m| !m.is_empty())
            .map(|m| Value::String(m.to_string()))
            .ok_or_else(|| AppError::RegexNoMatch {
                pattern: pattern.to_string(),
            }),
    }
}

fn cast(
    value: Value,
    target: CastTarget,
    options: Option<&CastOptions>,
    ctx: &mut TransformContext<'_>,
) -> Result<Value, AppError> {
    match target {
        CastTarget::Url => {
            let input = expect_string(value, "transformer:cast(url)")?;
            cast_url(&input, ctx.hostname).map(Value::String)
        }
        CastTarget::Number => match value {
            Value::Number(_) => Ok(value),
            Value::String(input) => {
                let forced = options
                    .and_then(|o| o.force_locale.as_deref())
                    .map(NumberParser::new);
                let parser = forced.as_ref().unwrap_or(ctx.numbers);
                match parser.parse(&input) {
                    Some(n) => Ok(number_value(n)),
                    None => {
                        ctx.warnings.push(format!(
                            "Could not parse '{input}' as a number with locale {}",
                            parser.locale()
                        ));
                        Ok(Value::Null)
                    }
                }
            }
            other => Err(AppError::InvalidValue {
                transformer: "transformer:cast(number)",
                value: other.to_string(),
            }),
        },
    }
}

fn cast_url(input: &str, hostname: &str) -> Result<String, AppError> {
    if let Ok(absolute) = Url::parse(input) {
        return Ok(absolute.to_string());
    }
    let invalid = |reason: String| AppError::InvalidValue {
        transformer: "transformer:cast(url)",
        value: format!("{input} ({reason})"),
    };
    let base = Url::parse(&origin_url(hostname)).map_err(|e| invalid(e.to_string()))?;
    base.join(input)
        .map(|u| u.to_string())
        .map_err(|e| invalid(e.to_string()))
}

/// Integral values become JSON integers so `"1435"` compares equal to `1435`.
fn number_value(n: f64) -> Value {
    const MAX_SAFE: f64 = 9_007_199_254_740_991.0;
    if n.fract() == 0.0 && n.abs() <= MAX_SAFE {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

fn trim(value: Value, options: &[TrimOption]) -> Result<Value, AppError> {
    let mut out = expect_string(value, "transformer:trim")?;

    if options.contains(&TrimOption::Inside) {
        out = collapse_inside(&out);
    }
    if options.contains(&TrimOption::Outside) {
        out = out.trim().to_string();
    }
    Ok(Value::String(out))
}

/// Collapse runs of spaces and any whitespace surrounding a newline.
fn collapse_inside(input: &str) -> String {
    let mut spaces = String::with_capacity(input.len());
    let mut previous_space = false;
    for c in input.chars() {
        if c == ' ' {
            if !previous_space {
                spaces.push(' ');
            }
            previous_space = true;
        } else {
            spaces.push(c);
            previous_space = false;
        }
    }

    let mut out = String::with_capacity(spaces.len());
    let mut chars = spaces.chars().peekable();
    while let Some(c) = chars.next() {
        if !c.is_whitespace() {
            out.push(c);
            continue;
        }
        // Gather the whole whitespace run; it becomes a single newline if it
        // contains one, otherwise it is kept as is.
        let mut run = String::from(c);
        while let Some(&next) = chars.peek() {
            if !next.is_whitespace() {
                break;
            }
            run.push(next);
            chars.next();
        }
        if run.contains('\n') {
            out.push('\n');
        } else {
            out.push_str(&run);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn run(value: Value, transformers: &[Transformer]) -> (Result<Value, AppError>, Vec<String>) {
        let numbers = NumberParser::new("en");
        let mut warnings = Vec::new();
        let mut ctx = TransformContext {
            hostname: "example.com",
            numbers: &numbers,
            warnings: &mut warnings,
        };
        let result = apply_all(value, transformers, &mut ctx);
        (result, warnings)
    }

    fn regex(pattern: &str, replacement: Option<&str>) -> Transformer {
        Transformer::Regex {
            regex: pattern.into(),
            replacement: replacement.map(Into::into),
        }
    }

    fn cast(target: CastTarget) -> Transformer {
        Transformer::Cast {
            target,
            options: None,
        }
    }

    #[test]
    fn regex_extracts_first_group() {
        let (out, _) = run(json!("100 good memes"), &[regex(r"(\d+)", None)]);
        assert_eq!(out.unwrap(), json!("100"));
    }

    #[test]
    fn regex_replaces_first_match() {
        let (out, _) = run(json!("a-b-c"), &[regex("-", Some("+"))]);
        assert_eq!(out.unwrap(), json!("a+b-c"));
    }

    #[test]
    fn regex_without_match_fails() {
        let (out, _) = run(json!("no digits"), &[regex(r"(\d+)", None)]);
        assert!(matches!(out.unwrap_err(), AppError::RegexNoMatch { .. }));
    }

    #[test]
    fn regex_on_null_is_invalid_value() {
        let (out, _) = run(Value::Null, &[regex(r"(\d+)", None)]);
        assert!(matches!(out.unwrap_err(), AppError::InvalidValue { .. }));
    }

    #[test]
    fn number_cast_uses_locale_or_override() {
        let (out, _) = run(json!("1.435"), &[cast(CastTarget::Number)]);
        assert_eq!(out.unwrap(), json!(1.435));

        let forced = Transformer::Cast {
            target: CastTarget::Number,
            options: Some(CastOptions {
                force_locale: Some("tr".into()),
            }),
        };
        let (out, _) = run(json!("1.435"), &[forced]);
        assert_eq!(out.unwrap(), json!(1435));
    }

    #[test]
    fn number_cast_passes_numbers_and_rejects_objects() {
        let (out, _) = run(json!(42), &[cast(CastTarget::Number)]);
        assert_eq!(out.unwrap(), json!(42));

        let (out, _) = run(json!({"a": 1}), &[cast(CastTarget::Number)]);
        assert!(matches!(out.unwrap_err(), AppError::InvalidValue { .. }));
    }

    #[test]
    fn unparseable_number_is_a_warning() {
        let (out, warnings) = run(json!("n/a"), &[cast(CastTarget::Number)]);
        assert_eq!(out.unwrap(), Value::Null);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn url_cast_resolves_relative_urls() {
        let (out, _) = run(json!("/1"), &[cast(CastTarget::Url)]);
        assert_eq!(out.unwrap(), json!("https://example.com/1"));

        let (out, _) = run(json!("https://other.org/x?y=1"), &[cast(CastTarget::Url)]);
        assert_eq!(out.unwrap(), json!("https://other.org/x?y=1"));
    }

    #[test]
    fn fallback_only_replaces_null() {
        let fallback = Transformer::Fallback {
            value: "none".into(),
        };
        let (out, _) = run(Value::Null, std::slice::from_ref(&fallback));
        assert_eq!(out.unwrap(), json!("none"));
        let (out, _) = run(json!("x"), &[fallback]);
        assert_eq!(out.unwrap(), json!("x"));
    }

    #[test]
    fn trim_inside_and_outside() {
        let trim = Transformer::Trim {
            options: vec![TrimOption::Outside, TrimOption::Inside],
        };
        let (out, _) = run(json!("  Satılık   Daire \n   İstanbul  "), &[trim]);
        assert_eq!(out.unwrap(), json!("Satılık Daire\nİstanbul"));
    }

    #[test]
    fn unrecognized_transformer_warns_once_and_passes_through() {
        let (out, warnings) = run(json!("4815162342"), &[Transformer::Unrecognized]);
        assert_eq!(out.unwrap(), json!("4815162342"));
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn transformers_chain_in_order() {
        let chain = [
            Transformer::Trim {
                options: vec![TrimOption::Outside],
            },
            regex(r"([\d.]+) TL", None),
            cast(CastTarget::Number),
        ];
        let numbers = NumberParser::new("tr");
        let mut warnings = Vec::new();
        let mut ctx = TransformContext {
            hostname: "example.com",
            numbers: &numbers,
            warnings: &mut warnings,
        };
        let out = apply_all(json!("  3.250.000 TL "), &chain, &mut ctx).unwrap();
        assert_eq!(out, json!(3_250_000));
    }
}
