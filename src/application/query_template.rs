// Query template substitution - time window placeholders
use crate::domain::time_span::TimeSpan;
use regex::{Captures, Regex};
use std::sync::LazyLock;

/// Target number of points a time series should show for any window.
pub const TARGET_POINTS: i64 = 60;

/// Candidate bucket widths in seconds, ascending.
const ROUNDING_STEPS: [i64; 17] = [
    1, 5, 10, 15, 30, 60, 120, 300, 600, 900, 1800, 3600, 7200, 10800, 21600, 43200, 86400,
];

// `{name}` or `{name:Type}`; the type may carry parentheses, e.g. Nullable(String).
static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)(?::[^{}]+)?\}").expect("placeholder pattern")
});

/// Bucket width in seconds for the given span length.
pub fn rounding_interval(span_seconds: i64) -> i64 {
    let wanted = (span_seconds.max(0) + TARGET_POINTS - 1) / TARGET_POINTS;
    ROUNDING_STEPS
        .iter()
        .copied()
        .find(|step| *step >= wanted)
        .unwrap_or(ROUNDING_STEPS[ROUNDING_STEPS.len() - 1])
}

/// Replace every recognised time placeholder. Unknown placeholders are left
/// for the execution service to bind.
pub fn substitute_time_placeholders(query: &str, span: &TimeSpan) -> String {
    let seconds = span.duration().num_seconds();
    PLACEHOLDER
        .replace_all(query, |caps: &Captures| match &caps[1] {
            "rounding" | "interval" => rounding_interval(seconds).to_string(),
            "seconds" => seconds.to_string(),
            "from" => format!("'{}'", span.start_iso()),
            "to" => format!("'{}'", span.end_iso()),
            "startTimestamp" => span.start_unix().to_string(),
            "endTimestamp" => span.end_unix().to_string(),
            _ => caps[0].to_string(),
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, Utc};

    fn span(minutes: i64) -> TimeSpan {
        let end = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        TimeSpan::new(end - Duration::minutes(minutes), end)
    }

    #[test]
    fn test_fifteen_minute_window() {
        let query = "SELECT toStartOfInterval(event_time, INTERVAL {rounding:UInt32} SECOND) AS t \
                     FROM system.query_log WHERE event_time >= {from:String} AND event_time < {to:String}";
        let result = substitute_time_placeholders(query, &span(15));

        assert!(result.contains("INTERVAL 15 SECOND"), "{}", result);
        assert!(result.contains("event_time >= '2024-05-01T11:45:00.000Z'"));
        assert!(result.contains("event_time < '2024-05-01T12:00:00.000Z'"));
        let rounding = rounding_interval(15 * 60);
        assert!((10..=30).contains(&rounding));
    }

    #[test]
    fn test_unknown_placeholders_untouched() {
        let query = "SELECT * FROM t WHERE db = {database:String} AND ts > {startTimestamp:UInt64}";
        let result = substitute_time_placeholders(query, &span(60));
        assert!(result.contains("{database:String}"));
        assert!(result.contains(&format!("ts > {}", span(60).start_unix())));
    }

    #[test]
    fn test_rounding_is_monotonic() {
        let mut previous = 0;
        for minutes in [1, 5, 15, 30, 60, 180, 360, 720, 1440, 4320, 10080, 100000] {
            let rounding = rounding_interval(minutes * 60);
            assert!(rounding >= previous);
            previous = rounding;
        }
        assert_eq!(rounding_interval(5 * 60), 5);
        assert_eq!(rounding_interval(7 * 86400), 10800);
    }

    #[test]
    fn test_reversed_span_is_substituted_mechanically() {
        let s = span(10);
        let reversed = TimeSpan::new(s.end, s.start);
        let result = substitute_time_placeholders("{seconds} {rounding}", &reversed);
        assert_eq!(result, "-600 1");
    }
}
