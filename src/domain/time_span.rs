// Time span model - absolute windows and relative display spans
use chrono::{DateTime, Duration, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Index into [`builtin_time_spans`] used when nothing else is selected.
pub const DEFAULT_TIME_SPAN_INDEX: usize = 2;

/// A resolved, absolute time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSpan {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeSpan {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn start_iso(&self) -> String {
        self.start.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn end_iso(&self) -> String {
        self.end.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn start_unix(&self) -> i64 {
        self.start.timestamp()
    }

    pub fn end_unix(&self) -> i64 {
        self.end.timestamp()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RelativeRule {
    /// The trailing window of the given length ending at "now".
    Last { seconds: i64 },
    /// From UTC midnight of the current day until "now".
    Today,
    /// The whole previous UTC day.
    Yesterday,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayTimeSpan {
    pub label: String,
    pub rule: RelativeRule,
}

impl DisplayTimeSpan {
    pub fn last(label: &str, seconds: i64) -> Self {
        Self {
            label: label.to_string(),
            rule: RelativeRule::Last { seconds },
        }
    }

    /// Resolve against the supplied wall-clock instant.
    pub fn resolve(&self, now: DateTime<Utc>) -> TimeSpan {
        match self.rule {
            RelativeRule::Last { seconds } => TimeSpan::new(now - Duration::seconds(seconds), now),
            RelativeRule::Today => TimeSpan::new(start_of_day(now), now),
            RelativeRule::Yesterday => {
                let today = start_of_day(now);
                TimeSpan::new(today - Duration::days(1), today)
            }
        }
    }
}

/// What a user picked in the time span selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimeSpanSelection {
    Absolute(TimeSpan),
    Relative(DisplayTimeSpan),
}

impl TimeSpanSelection {
    pub fn resolve(&self, now: DateTime<Utc>) -> TimeSpan {
        match self {
            TimeSpanSelection::Absolute(span) => *span,
            TimeSpanSelection::Relative(display) => display.resolve(now),
        }
    }
}

pub fn builtin_time_spans() -> Vec<DisplayTimeSpan> {
    vec![
        DisplayTimeSpan::last("Last 5 Mins", 5 * 60),
        DisplayTimeSpan::last("Last 15 Mins", 15 * 60),
        DisplayTimeSpan::last("Last 30 Mins", 30 * 60),
        DisplayTimeSpan::last("Last 1 Hour", 3600),
        DisplayTimeSpan::last("Last 3 Hours", 3 * 3600),
        DisplayTimeSpan::last("Last 6 Hours", 6 * 3600),
        DisplayTimeSpan::last("Last 12 Hours", 12 * 3600),
        DisplayTimeSpan::last("Last 24 Hours", 24 * 3600),
        DisplayTimeSpan {
            label: "Today".to_string(),
            rule: RelativeRule::Today,
        },
        DisplayTimeSpan {
            label: "Yesterday".to_string(),
            rule: RelativeRule::Yesterday,
        },
        DisplayTimeSpan::last("Last 3 Days", 3 * 86400),
        DisplayTimeSpan::last("Last 7 Days", 7 * 86400),
    ]
}

pub fn default_time_span() -> DisplayTimeSpan {
    builtin_time_spans().swap_remove(DEFAULT_TIME_SPAN_INDEX)
}

/// Case-insensitive lookup of a built-in span by its label.
pub fn find_builtin(label: &str) -> Option<DisplayTimeSpan> {
    builtin_time_spans()
        .into_iter()
        .find(|span| span.label.eq_ignore_ascii_case(label.trim()))
}

fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    let midnight = now.date_naive().and_hms_opt(0, 0, 0).unwrap_or_default();
    Utc.from_utc_datetime(&midnight)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_default_is_not_first_entry() {
        let default = default_time_span();
        assert_eq!(default.label, "Last 30 Mins");
        assert_ne!(default, builtin_time_spans()[0]);
    }

    #[test]
    fn test_relative_span_captures_now_at_resolution() {
        let span = find_builtin("last 15 mins").unwrap();
        let first = span.resolve(at("2024-03-01T10:00:00Z"));
        let later = span.resolve(at("2024-03-01T10:05:00Z"));

        assert_eq!(first.start, at("2024-03-01T09:45:00Z"));
        assert_eq!(first.end, at("2024-03-01T10:00:00Z"));
        assert_eq!(later.start, at("2024-03-01T09:50:00Z"));
        assert_eq!(first.duration(), Duration::minutes(15));
    }

    #[test]
    fn test_today_and_yesterday() {
        let now = at("2024-03-01T10:30:00Z");
        let today = find_builtin("Today").unwrap().resolve(now);
        assert_eq!(today.start, at("2024-03-01T00:00:00Z"));
        assert_eq!(today.end, now);

        let yesterday = find_builtin("Yesterday").unwrap().resolve(now);
        assert_eq!(yesterday.start, at("2024-02-29T00:00:00Z"));
        assert_eq!(yesterday.end, at("2024-03-01T00:00:00Z"));
    }

    #[test]
    fn test_absolute_selection_is_stable() {
        let span = TimeSpan::new(at("2024-01-01T00:00:00Z"), at("2024-01-01T01:00:00Z"));
        let selection = TimeSpanSelection::Absolute(span);
        assert_eq!(selection.resolve(at("2030-01-01T00:00:00Z")), span);
        assert_eq!(span.start_iso(), "2024-01-01T00:00:00.000Z");
        assert_eq!(span.end_unix() - span.start_unix(), 3600);
    }
}
