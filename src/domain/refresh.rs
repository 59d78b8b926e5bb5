// Parameters driving one panel refresh
use super::time_span::TimeSpan;
use serde::Serialize;

/// Distinctness marker; two refreshes with the same span but different
/// tokens are never collapsed into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshToken {
    pub issued_at_millis: i64,
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputFilter {
    pub token: RefreshToken,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshOptions {
    pub selected_time_span: Option<TimeSpan>,
    pub input_filter: Option<InputFilter>,
    pub force_refresh: bool,
}

impl RefreshOptions {
    pub fn new(span: TimeSpan, input_filter: InputFilter) -> Self {
        Self {
            selected_time_span: Some(span),
            input_filter: Some(input_filter),
            force_refresh: false,
        }
    }

    pub fn forced(mut self) -> Self {
        self.force_refresh = true;
        self
    }

    pub fn filter_text(&self) -> Option<&str> {
        self.input_filter
            .as_ref()
            .and_then(|f| f.text.as_deref())
            .filter(|t| !t.is_empty())
    }
}
