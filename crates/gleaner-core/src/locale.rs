//! Locale-aware number parsing for `cast:number`.

/// Parses localized numeric strings such as `1.435` (en) or `1.435` (tr).
#[derive(Debug, Clone, PartialEq)]
pub struct NumberParser {
    locale: String,
    decimal: char,
    group: char,
}

impl NumberParser {
    /// Build a parser for a BCP 47 locale tag. Only the primary language
    /// subtag is significant; unknown languages use English separators.
    pub fn new(locale: &str) -> Self {
        let language = locale
            .split(['-', '_'])
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        let (decimal, group) = separators(&language);
        Self {
            locale: locale.to_string(),
            decimal,
            group,
        }
    }

    pub fn locale(&self) -> &str {
        &self.locale
    }

    /// Parse a localized number. Returns `None` for anything that is not a
    /// plain (optionally signed, optionally grouped) decimal number.
    pub fn parse(&self, input: &str) -> Option<f64> {
        let mut normalized = String::with_capacity(input.len());
        for c in input.trim().chars() {
            if c == self.decimal {
                normalized.push('.');
            } else if c == self.group || c.is_whitespace() || c == '\u{202f}' {
                continue;
            } else if c.is_ascii_digit() || c == '-' || c == '+' {
                normalized.push(c);
            } else if c == '\u{2212}' {
                normalized.push('-');
            } else {
                return None;
            }
        }
        if normalized.is_empty() || normalized.matches('.').count() > 1 {
            return None;
        }
        normalized.parse::<f64>().ok().filter(|n| n.is_finite())
    }
}

impl Default for NumberParser {
    fn default() -> Self {
        Self::new("en")
    }
}

fn separators(language: &str) -> (char, char) {
    match language {
        // comma decimal, dot grouping
        "tr" | "de" | "es" | "it" | "pt" | "nl" | "id" | "da" | "el" | "ro" | "hr" | "sl"
        | "sr" | "vi" | "is" | "ca" | "az" => (',', '.'),
        // comma decimal, space grouping
        "fr" | "ru" | "pl" | "cs" | "sk" | "sv" | "fi" | "nb" | "no" | "uk" | "hu" | "bg"
        | "lt" | "lv" | "et" | "kk" | "be" => (',', '\u{a0}'),
        _ => ('.', ','),
    }
}
