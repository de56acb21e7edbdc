//! Value conversion between column types.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use tabula_core::{CellValue, ColumnType};

/// Result of converting one value.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionOutcome {
    pub success: bool,
    /// Converted value. `None` on failure.
    pub new_value: Option<CellValue>,
    /// True when the new value does not exactly preserve the old meaning.
    pub data_loss: bool,
    pub warning: Option<String>,
    pub error: Option<String>,
}

impl ConversionOutcome {
    pub fn converted(value: CellValue) -> Self {
        Self {
            success: true,
            new_value: Some(value),
            data_loss: false,
            warning: None,
            error: None,
        }
    }

    pub fn lossy(value: CellValue, warning: impl Into<String>) -> Self {
        Self {
            data_loss: true,
            warning: Some(warning.into()),
            ..Self::converted(value)
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            new_value: None,
            data_loss: false,
            warning: None,
            error: Some(error.into()),
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warning = Some(warning.into());
        self
    }

    /// Converted, but the stored value is reinterpreted or loses detail.
    pub fn is_lossy(&self) -> bool {
        self.success && (self.data_loss || self.warning.is_some())
    }
}

/// Per-type-pair conversion of cell values.
pub trait ConversionRules: Send + Sync {
    /// Convert `value`, stored under `from`, into a value valid under `to`.
    fn attempt_conversion(&self, value: &CellValue, from: ColumnType, to: ColumnType) -> ConversionOutcome;

    /// Human-readable description of what converting `from` to `to` does.
    fn conversion_description(&self, from: ColumnType, to: ColumnType) -> String;
}

/// Conversion rules for the built-in column types.
///
/// Numbers accept common formatting (thousands separators, currency signs)
/// at the cost of a lossy flag. Integers round. Dates accept RFC 3339,
/// `YYYY-MM-DD`, `YYYY/MM/DD` and `DD.MM.YYYY`. Anything can become text
/// or JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardConversionRules;

/// Largest integer an `f64` represents exactly.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

const TRUE_WORDS: [&str; 6] = ["true", "yes", "y", "1", "on", "da"];
const FALSE_WORDS: [&str; 6] = ["false", "no", "n", "0", "off", "nu"];

impl StandardConversionRules {
    pub fn new() -> Self {
        Self
    }

    fn to_text(value: &CellValue) -> ConversionOutcome {
        let text = match value {
            CellValue::Null => return ConversionOutcome::converted(CellValue::Null),
            CellValue::Text(s) => s.clone(),
            CellValue::Bool(b) => b.to_string(),
            CellValue::Number(n) => n.to_string(),
            CellValue::Date(d) => d.to_rfc3339(),
            CellValue::Json(serde_json::Value::String(s)) => s.clone(),
            CellValue::Json(v) => v.to_string(),
        };
        ConversionOutcome::converted(CellValue::Text(text))
    }

    fn to_number(value: &CellValue) -> ConversionOutcome {
        match value {
            CellValue::Number(n) => ConversionOutcome::converted(CellValue::Number(*n)),
            CellValue::Bool(b) => ConversionOutcome::converted(CellValue::Number(if *b { 1.0 } else { 0.0 })),
            CellValue::Text(s) => parse_number(s),
            CellValue::Date(d) => ConversionOutcome::lossy(
                CellValue::Number(d.timestamp_millis() as f64),
                "date stored as Unix epoch milliseconds",
            ),
            CellValue::Json(serde_json::Value::Number(n)) => match n.as_f64() {
                Some(f) => ConversionOutcome::converted(CellValue::Number(f)),
                None => ConversionOutcome::failed(format!("{} is out of range", n)),
            },
            CellValue::Json(_) => ConversionOutcome::failed("JSON value is not a number"),
            CellValue::Null => ConversionOutcome::converted(CellValue::Null),
        }
    }

    fn to_integer(value: &CellValue) -> ConversionOutcome {
        let outcome = Self::to_number(value);
        let Some(CellValue::Number(n)) = outcome.new_value else {
            return outcome;
        };
        if !n.is_finite() || n.abs() > MAX_SAFE_INTEGER {
            return ConversionOutcome::failed(format!("{} is outside the integer range", n));
        }
        let rounded = n.round();
        if rounded != n {
            return ConversionOutcome::lossy(
                CellValue::Number(rounded),
                format!("{} rounded to {}", n, rounded),
            );
        }
        ConversionOutcome {
            new_value: Some(CellValue::Number(rounded)),
            ..outcome
        }
    }

    fn to_boolean(value: &CellValue) -> ConversionOutcome {
        match value {
            CellValue::Bool(b) => ConversionOutcome::converted(CellValue::Bool(*b)),
            CellValue::Number(n) if *n == 0.0 => ConversionOutcome::converted(CellValue::Bool(false)),
            CellValue::Number(n) if *n == 1.0 => ConversionOutcome::converted(CellValue::Bool(true)),
            CellValue::Number(n) => ConversionOutcome::failed(format!("{} is neither 0 nor 1", n)),
            CellValue::Text(s) => {
                let word = s.trim().to_lowercase();
                if TRUE_WORDS.contains(&word.as_str()) {
                    ConversionOutcome::converted(CellValue::Bool(true))
                } else if FALSE_WORDS.contains(&word.as_str()) {
                    ConversionOutcome::converted(CellValue::Bool(false))
                } else {
                    ConversionOutcome::failed(format!("{:?} is not a boolean", s))
                }
            }
            CellValue::Json(serde_json::Value::Bool(b)) => ConversionOutcome::converted(CellValue::Bool(*b)),
            CellValue::Date(_) | CellValue::Json(_) => {
                ConversionOutcome::failed(format!("{} value is not a boolean", value.kind_name()))
            }
            CellValue::Null => ConversionOutcome::converted(CellValue::Null),
        }
    }

    fn to_date(value: &CellValue) -> ConversionOutcome {
        match value {
            CellValue::Date(d) => ConversionOutcome::converted(CellValue::Date(*d)),
            CellValue::Text(s) => match parse_date(s.trim()) {
                Some((date, exact)) if exact => ConversionOutcome::converted(CellValue::Date(date)),
                Some((date, _)) => ConversionOutcome::converted(CellValue::Date(date))
                    .with_warning("date without time stored as midnight UTC"),
                None => ConversionOutcome::failed(format!("{:?} is not a recognized date", s)),
            },
            CellValue::Number(n) => match Utc.timestamp_millis_opt(*n as i64).single() {
                Some(date) if n.fract() == 0.0 => ConversionOutcome::converted(CellValue::Date(date))
                    .with_warning("number read as Unix epoch milliseconds"),
                _ => ConversionOutcome::failed(format!("{} is not a valid timestamp", n)),
            },
            CellValue::Json(serde_json::Value::String(s)) => Self::to_date(&CellValue::Text(s.clone())),
            CellValue::Bool(_) | CellValue::Json(_) => {
                ConversionOutcome::failed(format!("{} value is not a date", value.kind_name()))
            }
            CellValue::Null => ConversionOutcome::converted(CellValue::Null),
        }
    }

    fn to_json(value: &CellValue) -> ConversionOutcome {
        let json = match value {
            CellValue::Null => return ConversionOutcome::converted(CellValue::Null),
            CellValue::Json(v) => v.clone(),
            CellValue::Bool(b) => serde_json::Value::Bool(*b),
            CellValue::Number(n) => match serde_json::Number::from_f64(*n) {
                Some(num) => serde_json::Value::Number(num),
                None => return ConversionOutcome::failed(format!("{} has no JSON representation", n)),
            },
            CellValue::Date(d) => serde_json::Value::String(d.to_rfc3339()),
            CellValue::Text(s) => match serde_json::from_str::<serde_json::Value>(s) {
                Ok(parsed) if parsed.is_object() || parsed.is_array() => parsed,
                _ => serde_json::Value::String(s.clone()),
            },
        };
        ConversionOutcome::converted(CellValue::Json(json))
    }

    fn to_email(value: &CellValue) -> ConversionOutcome {
        let CellValue::Text(s) = value else {
            return ConversionOutcome::failed(format!("{} value is not an email address", value.kind_name()));
        };
        let trimmed = s.trim();
        if !is_email(trimmed) {
            return ConversionOutcome::failed(format!("{:?} is not an email address", s));
        }
        let normalized = trimmed.to_lowercase();
        if normalized != *s {
            return ConversionOutcome::converted(CellValue::Text(normalized))
                .with_warning("email address trimmed and lowercased");
        }
        ConversionOutcome::converted(CellValue::Text(normalized))
    }

    fn to_url(value: &CellValue) -> ConversionOutcome {
        let CellValue::Text(s) = value else {
            return ConversionOutcome::failed(format!("{} value is not a URL", value.kind_name()));
        };
        let trimmed = s.trim();
        if has_web_scheme(trimmed) {
            return if trimmed.len() > "https://".len() && !trimmed.contains(char::is_whitespace) {
                ConversionOutcome::converted(CellValue::Text(trimmed.to_string()))
            } else {
                ConversionOutcome::failed(format!("{:?} is not a URL", s))
            };
        }
        if looks_like_domain(trimmed) {
            return ConversionOutcome::converted(CellValue::Text(format!("https://{}", trimmed)))
                .with_warning("https:// scheme added");
        }
        ConversionOutcome::failed(format!("{:?} is not a URL", s))
    }
}

impl ConversionRules for StandardConversionRules {
    fn attempt_conversion(&self, value: &CellValue, _from: ColumnType, to: ColumnType) -> ConversionOutcome {
        match to.canonical() {
            ColumnType::Text | ColumnType::String => Self::to_text(value),
            ColumnType::Number => Self::to_number(value),
            ColumnType::Integer => Self::to_integer(value),
            ColumnType::Boolean => Self::to_boolean(value),
            ColumnType::Date => Self::to_date(value),
            ColumnType::Json => Self::to_json(value),
            ColumnType::Email => Self::to_email(value),
            ColumnType::Url => Self::to_url(value),
        }
    }

    fn conversion_description(&self, from: ColumnType, to: ColumnType) -> String {
        if from.is_equivalent(to) {
            return format!("{} and {} store values identically; nothing changes", from, to);
        }
        let effect = match to.canonical() {
            ColumnType::Text | ColumnType::String => "every value is written out as text",
            ColumnType::Number => "text is parsed as a number; separators and currency signs are dropped",
            ColumnType::Integer => "values are parsed as numbers and rounded to whole numbers",
            ColumnType::Boolean => "only yes/no style words and 0/1 are accepted",
            ColumnType::Date => "text is parsed as a date; values without a time become midnight UTC",
            ColumnType::Json => "values are wrapped as JSON; JSON object or array text is parsed",
            ColumnType::Email => "only valid email addresses are kept, lowercased",
            ColumnType::Url => "only web addresses are kept; bare domains get https://",
        };
        format!("{} to {}: {}", from, to, effect)
    }
}

fn parse_number(s: &str) -> ConversionOutcome {
    let trimmed = s.trim();
    if let Ok(n) = trimmed.parse::<f64>() {
        if n.is_finite() {
            return ConversionOutcome::converted(CellValue::Number(n));
        }
    }

    let unsigned = trimmed
        .trim_start_matches(['$', '€', '£'])
        .trim_end_matches(['$', '€', '£', '%'])
        .trim_end_matches(" RON");
    let cleaned: String = match decimal_comma(unsigned) {
        Some((whole, fraction)) => format!("{}.{}", whole.replace(['.', ' ', '_'], ""), fraction),
        None => unsigned
            .chars()
            .filter(|c| !matches!(c, ',' | ' ' | '_'))
            .collect(),
    };
    match cleaned.parse::<f64>() {
        Ok(n) if n.is_finite() && !cleaned.is_empty() => ConversionOutcome::lossy(
            CellValue::Number(n),
            format!("formatting dropped from {:?}", s),
        ),
        _ => ConversionOutcome::failed(format!("{:?} is not numeric", s)),
    }
}

/// Split `1,5` or `1.234,50` at a comma used as the decimal separator.
///
/// A single comma followed by one or two digits is read as decimal; three
/// trailing digits (`1,200`) stay a thousands separator.
fn decimal_comma(s: &str) -> Option<(&str, &str)> {
    let (whole, fraction) = s.rsplit_once(',')?;
    if whole.contains(',') || fraction.is_empty() || fraction.len() > 2 {
        return None;
    }
    if !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((whole, fraction))
}

/// Parse a date, returning whether the input carried a time of day.
fn parse_date(s: &str) -> Option<(DateTime<Utc>, bool)> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some((dt.with_timezone(&Utc), true));
    }
    ["%Y-%m-%d", "%Y/%m/%d", "%d.%m.%Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| (naive.and_utc(), false))
}

fn is_email(s: &str) -> bool {
    let Some((local, domain)) = s.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && looks_like_domain(domain)
}

fn has_web_scheme(s: &str) -> bool {
    let lower = s.to_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

fn looks_like_domain(s: &str) -> bool {
    let host = s.split('/').next().unwrap_or_default();
    let labels: Vec<&str> = host.split('.').collect();
    labels.len() >= 2
        && labels
            .iter()
            .all(|l| !l.is_empty() && l.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'))
        && !s.contains(char::is_whitespace)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn convert(value: CellValue, from: ColumnType, to: ColumnType) -> ConversionOutcome {
        StandardConversionRules.attempt_conversion(&value, from, to)
    }

    #[test]
    fn test_text_to_number() {
        let clean = convert(CellValue::text(" 42.5 "), ColumnType::Text, ColumnType::Number);
        assert!(clean.success && !clean.data_loss);
        assert_eq!(clean.new_value, Some(CellValue::Number(42.5)));

        let formatted = convert(CellValue::text("$1,234.50"), ColumnType::Text, ColumnType::Number);
        assert!(formatted.success && formatted.data_loss);
        assert_eq!(formatted.new_value, Some(CellValue::Number(1234.5)));

        let thousands = convert(CellValue::text("1,200"), ColumnType::Text, ColumnType::Number);
        assert_eq!(thousands.new_value, Some(CellValue::Number(1200.0)));

        let bad = convert(CellValue::text("abc"), ColumnType::Text, ColumnType::Number);
        assert!(!bad.success);
        assert!(bad.error.unwrap().contains("not numeric"));
    }

    #[test]
    fn test_comma_decimal_separator() {
        for (input, expected) in [("1,5", 1.5), ("12,75", 12.75), ("1.234,50", 1234.5), ("-0,25", -0.25)] {
            let outcome = convert(CellValue::text(input), ColumnType::Text, ColumnType::Number);
            assert_eq!(outcome.new_value, Some(CellValue::Number(expected)), "{input}");
            assert!(outcome.is_lossy(), "{input}");
        }
    }

    #[test]
    fn test_reinterpreting_conversions_are_lossy() {
        let epoch = convert(CellValue::Number(1999.0), ColumnType::Number, ColumnType::Date);
        assert!(epoch.success && epoch.is_lossy());

        let midnight = convert(CellValue::text("2024-03-01"), ColumnType::Text, ColumnType::Date);
        assert!(midnight.is_lossy());

        let exact = convert(CellValue::text("42"), ColumnType::Text, ColumnType::Number);
        assert!(!exact.is_lossy());
        assert!(!convert(CellValue::text("abc"), ColumnType::Text, ColumnType::Number).is_lossy());
    }

    #[test]
    fn test_integer_rounds_lossily() {
        let outcome = convert(CellValue::Number(3.7), ColumnType::Number, ColumnType::Integer);
        assert!(outcome.success && outcome.data_loss);
        assert_eq!(outcome.new_value, Some(CellValue::Number(4.0)));

        let exact = convert(CellValue::text("12"), ColumnType::Text, ColumnType::Integer);
        assert!(exact.success && !exact.data_loss);
    }

    #[test]
    fn test_boolean_words() {
        for (input, expected) in [("Yes", true), ("off", false), ("1", true), ("DA", true)] {
            let outcome = convert(CellValue::text(input), ColumnType::Text, ColumnType::Boolean);
            assert_eq!(outcome.new_value, Some(CellValue::Bool(expected)), "{input}");
        }
        assert!(!convert(CellValue::text("maybe"), ColumnType::Text, ColumnType::Boolean).success);
        assert!(!convert(CellValue::Number(2.0), ColumnType::Number, ColumnType::Boolean).success);
    }

    #[test]
    fn test_dates() {
        let iso = convert(CellValue::text("2024-03-01"), ColumnType::Text, ColumnType::Date);
        assert!(iso.success);
        assert!(iso.warning.is_some());

        let european = convert(CellValue::text("01.03.2024"), ColumnType::Text, ColumnType::Date);
        assert_eq!(european.new_value, iso.new_value);

        let full = convert(CellValue::text("2024-03-01T10:00:00Z"), ColumnType::Text, ColumnType::Date);
        assert!(full.success && full.warning.is_none());

        assert!(!convert(CellValue::text("next tuesday"), ColumnType::Text, ColumnType::Date).success);
    }

    #[test]
    fn test_email_and_url() {
        let email = convert(CellValue::text(" Ana@Example.RO "), ColumnType::Text, ColumnType::Email);
        assert_eq!(email.new_value, Some(CellValue::text("ana@example.ro")));
        assert!(!convert(CellValue::text("ana@"), ColumnType::Text, ColumnType::Email).success);
        assert!(!convert(CellValue::Number(1.0), ColumnType::Number, ColumnType::Email).success);

        let bare = convert(CellValue::text("example.com/path"), ColumnType::Text, ColumnType::Url);
        assert_eq!(bare.new_value, Some(CellValue::text("https://example.com/path")));
        assert!(!convert(CellValue::text("not a url"), ColumnType::Text, ColumnType::Url).success);
    }

    #[test]
    fn test_everything_becomes_text_or_json() {
        for value in [
            CellValue::Bool(true),
            CellValue::Number(1.5),
            CellValue::text("x"),
            CellValue::Json(serde_json::json!({"a": 1})),
        ] {
            assert!(convert(value.clone(), ColumnType::Json, ColumnType::Text).success);
            assert!(convert(value, ColumnType::Text, ColumnType::Json).success);
        }
    }

    #[test]
    fn test_description_mentions_types() {
        let description = StandardConversionRules.conversion_description(ColumnType::Text, ColumnType::Number);
        assert!(description.starts_with("text to number"));
    }
}
