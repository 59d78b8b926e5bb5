// Named value formatters for table cells and stat values
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

pub const DEFAULT_TRUNCATE_CHARS: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ColumnFormat {
    /// Grouped digits, e.g. `1,234,567`.
    Number,
    CompactNumber,
    Bytes,
    Percentage,
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
    DateTime,
    ShortText { max_chars: usize },
    /// Nested or compound values rendered as compact JSON.
    Structured,
    Sql,
    Text,
}

impl ColumnFormat {
    /// Resolve a formatter by the name used in `fieldOptions`.
    pub fn from_name(name: &str) -> Option<Self> {
        let format = match name {
            "number" => ColumnFormat::Number,
            "compact_number" => ColumnFormat::CompactNumber,
            "binary_byte" | "bytes" => ColumnFormat::Bytes,
            "percentage" => ColumnFormat::Percentage,
            "nanosecond" => ColumnFormat::Nanoseconds,
            "microsecond" => ColumnFormat::Microseconds,
            "millisecond" => ColumnFormat::Milliseconds,
            "second" => ColumnFormat::Seconds,
            "datetime" | "timestamp" => ColumnFormat::DateTime,
            "short_string" | "truncate_text" => ColumnFormat::ShortText {
                max_chars: DEFAULT_TRUNCATE_CHARS,
            },
            "json" => ColumnFormat::Structured,
            "sql" => ColumnFormat::Sql,
            "text" | "string" => ColumnFormat::Text,
            _ => return None,
        };
        Some(format)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ColumnFormat::Number
                | ColumnFormat::CompactNumber
                | ColumnFormat::Bytes
                | ColumnFormat::Percentage
                | ColumnFormat::Nanoseconds
                | ColumnFormat::Microseconds
                | ColumnFormat::Milliseconds
                | ColumnFormat::Seconds
        )
    }

    pub fn format(&self, value: &Value) -> String {
        if value.is_null() {
            return String::new();
        }
        match self {
            ColumnFormat::Number => numeric(value).map(group_digits).unwrap_or_else(|| plain(value)),
            ColumnFormat::CompactNumber => numeric(value).map(compact).unwrap_or_else(|| plain(value)),
            ColumnFormat::Bytes => numeric(value).map(binary_bytes).unwrap_or_else(|| plain(value)),
            ColumnFormat::Percentage => numeric(value)
                .map(|v| format!("{:.2}%", v))
                .unwrap_or_else(|| plain(value)),
            ColumnFormat::Nanoseconds => numeric(value)
                .map(|v| human_duration(v / 1e9))
                .unwrap_or_else(|| plain(value)),
            ColumnFormat::Microseconds => numeric(value)
                .map(|v| human_duration(v / 1e6))
                .unwrap_or_else(|| plain(value)),
            ColumnFormat::Milliseconds => numeric(value)
                .map(|v| human_duration(v / 1e3))
                .unwrap_or_else(|| plain(value)),
            ColumnFormat::Seconds => numeric(value).map(human_duration).unwrap_or_else(|| plain(value)),
            ColumnFormat::DateTime => datetime(value).unwrap_or_else(|| plain(value)),
            ColumnFormat::ShortText { max_chars } => truncate(&plain(value), *max_chars),
            ColumnFormat::Structured => value.to_string(),
            ColumnFormat::Sql => collapse_whitespace(&plain(value)),
            ColumnFormat::Text => plain(value),
        }
    }
}

/// Numbers may arrive quoted (64-bit integers are quoted on the wire).
pub fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

pub fn plain(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn group_digits(v: f64) -> String {
    let negative = v < 0.0;
    let cents = (v.abs() * 100.0).round() as u128;
    let whole = cents / 100;
    let fraction = cents % 100;

    let digits = whole.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    if fraction > 0 {
        let decimals = format!(".{:02}", fraction);
        grouped.push_str(decimals.trim_end_matches('0'));
    }
    if negative && cents > 0 {
        grouped.insert(0, '-');
    }
    grouped
}

fn compact(v: f64) -> String {
    const UNITS: [(f64, &str); 4] = [(1e12, "T"), (1e9, "B"), (1e6, "M"), (1e3, "K")];
    for (scale, suffix) in UNITS {
        if v.abs() >= scale {
            return format!("{:.1}{}", v / scale, suffix);
        }
    }
    group_digits(v)
}

fn binary_bytes(v: f64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    let mut size = v;
    let mut unit = 0;
    while size.abs() >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", size, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit])
    }
}

fn human_duration(seconds: f64) -> String {
    if seconds >= 86400.0 {
        format!("{:.1}d", seconds / 86400.0)
    } else if seconds >= 3600.0 {
        format!("{:.1}h", seconds / 3600.0)
    } else if seconds >= 60.0 {
        format!("{:.1}m", seconds / 60.0)
    } else if seconds >= 1.0 {
        format!("{:.2}s", seconds)
    } else if seconds >= 1e-3 {
        format!("{:.2}ms", seconds * 1e3)
    } else if seconds >= 1e-6 {
        format!("{:.2}µs", seconds * 1e6)
    } else {
        format!("{:.0}ns", seconds * 1e9)
    }
}

fn datetime(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => {
            let secs = n.as_i64()?;
            DateTime::<Utc>::from_timestamp(secs, 0)
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        }
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push('…');
    out
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_group_digits() {
        assert_eq!(group_digits(0.0), "0");
        assert_eq!(group_digits(999.0), "999");
        assert_eq!(group_digits(1234567.0), "1,234,567");
        assert_eq!(group_digits(-1234.5), "-1,234.5");
    }

    #[test]
    fn test_quoted_numbers_are_formatted() {
        assert_eq!(ColumnFormat::Number.format(&json!("18446744073709")), "18,446,744,073,709");
        assert_eq!(ColumnFormat::Bytes.format(&json!(2048)), "2.00 KiB");
        assert_eq!(ColumnFormat::Number.format(&json!(null)), "");
    }

    #[test]
    fn test_truncate_and_structured() {
        let long = "x".repeat(100);
        let shown = ColumnFormat::ShortText { max_chars: 10 }.format(&json!(long));
        assert_eq!(shown.chars().count(), 11);
        assert_eq!(ColumnFormat::Structured.format(&json!({"a": [1, 2]})), r#"{"a":[1,2]}"#);
    }

    #[test]
    fn test_named_formats() {
        assert_eq!(ColumnFormat::from_name("binary_byte"), Some(ColumnFormat::Bytes));
        assert_eq!(ColumnFormat::from_name("nope"), None);
        assert_eq!(ColumnFormat::Milliseconds.format(&json!(1500)), "1.50s");
        assert_eq!(ColumnFormat::Sql.format(&json!("SELECT\n  1")), "SELECT 1");
    }
}
