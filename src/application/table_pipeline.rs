// Tabular data pipeline - column discovery, positioning, sorting, windowing
use crate::domain::format::{ColumnFormat, DEFAULT_TRUNCATE_CHARS, numeric, plain};
use crate::domain::panel::{FieldOption, RowAction};
use crate::domain::query_result::{ColumnMeta, QueryResult, Row};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::ops::Range;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::time::Instant;

/// Tables with more rows than this only materialise a window of rows.
pub const VIRTUALIZATION_THRESHOLD: usize = 100;
pub const OVERSCAN_ROWS: usize = 10;
/// Rows sampled when inferring a column format.
const SAMPLE_ROWS: usize = 20;

pub const SKELETON_MIN_VISIBLE: Duration = Duration::from_millis(300);
pub const SKELETON_FADE: Duration = Duration::from_millis(200);

static ORDER_BY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bORDER\s+BY\b").expect("order by pattern"));
static TRAILING_CLAUSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(LIMIT|SETTINGS|FORMAT)\b").expect("tail pattern"));

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ColumnKind {
    Data,
    Action { action: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableColumn {
    pub name: String,
    pub title: String,
    pub data_type: String,
    pub format: ColumnFormat,
    pub sortable: bool,
    pub width: Option<u32>,
    pub kind: ColumnKind,
}

/// Rebuild the displayed columns from result metadata.
///
/// Columns follow server order, merged with `field_options` by name, then
/// re-sequenced by declared positions. Negative positions are hidden from
/// display but stay in the row data. Action columns always come last.
pub fn build_columns(
    meta: &[ColumnMeta],
    rows: &[Row],
    field_options: &[FieldOption],
    actions: &[RowAction],
) -> Vec<TableColumn> {
    let declared: Vec<(TableColumn, Option<i32>)> = meta
        .iter()
        .map(|column| {
            let option = field_options.iter().find(|o| o.name == column.name);
            let format = option
                .and_then(|o| o.format.clone())
                .unwrap_or_else(|| infer_format(&column.data_type, sample(rows, &column.name)));
            let table_column = TableColumn {
                name: column.name.clone(),
                title: option
                    .and_then(|o| o.title.clone())
                    .unwrap_or_else(|| column.name.clone()),
                data_type: column.data_type.clone(),
                format,
                sortable: option.and_then(|o| o.sortable).unwrap_or(true),
                width: option.and_then(|o| o.width),
                kind: ColumnKind::Data,
            };
            (table_column, option.and_then(|o| o.position))
        })
        .collect();

    let mut columns: Vec<TableColumn> = position_columns(declared, |(_, position)| *position)
        .into_iter()
        .map(|(column, _)| column)
        .collect();

    columns.extend(actions.iter().map(|action| TableColumn {
        name: action.name.clone(),
        title: action.title.clone(),
        data_type: String::new(),
        format: ColumnFormat::Text,
        sortable: false,
        width: None,
        kind: ColumnKind::Action {
            action: action.name.clone(),
        },
    }));
    columns
}

/// Stable slot merge. Items with a non-negative position go to that
/// 1-indexed slot (0 is treated as 1), ties keep input order, unpositioned
/// items fill the free slots in input order, negative positions are dropped.
pub fn position_columns<T>(items: Vec<T>, position_of: impl Fn(&T) -> Option<i32>) -> Vec<T> {
    let mut positioned: Vec<(usize, usize, T)> = Vec::new();
    let mut natural: VecDeque<T> = VecDeque::new();

    for (original, item) in items.into_iter().enumerate() {
        match position_of(&item) {
            Some(p) if p < 0 => {}
            Some(p) => positioned.push((p.max(1) as usize, original, item)),
            None => natural.push_back(item),
        }
    }
    if positioned.is_empty() {
        return natural.into();
    }
    positioned.sort_by_key(|(slot, original, _)| (*slot, *original));

    let total = positioned.len() + natural.len();
    let mut positioned = positioned.into_iter().peekable();
    let mut out = Vec::with_capacity(total);
    for slot in 1..=total {
        let take_positioned = positioned
            .peek()
            .is_some_and(|(wanted, _, _)| *wanted <= slot || natural.is_empty());
        let next = if take_positioned {
            positioned.next().map(|(_, _, item)| item)
        } else {
            natural.pop_front()
        };
        if let Some(item) = next {
            out.push(item);
        }
    }
    out
}

fn sample<'a>(rows: &'a [Row], column: &'a str) -> impl Iterator<Item = &'a Value> + 'a {
    rows.iter()
        .take(SAMPLE_ROWS)
        .filter_map(move |row| row.get(column))
        .filter(|v| !v.is_null())
}

/// Pick a format from the reported type, falling back to sampled values.
pub fn infer_format<'a>(data_type: &str, samples: impl Iterator<Item = &'a Value>) -> ColumnFormat {
    let base = unwrap_type(data_type);
    if is_numeric_type(base) {
        return ColumnFormat::Number;
    }
    if ["Array(", "Map(", "Tuple(", "Nested(", "JSON", "Object("]
        .iter()
        .any(|prefix| base.starts_with(prefix))
    {
        return ColumnFormat::Structured;
    }
    if base.starts_with("DateTime") || base == "Date" || base == "Date32" {
        return ColumnFormat::Text;
    }

    let mut all_numeric = true;
    let mut any = false;
    let mut long = false;
    for value in samples {
        any = true;
        match value {
            Value::Array(_) | Value::Object(_) => return ColumnFormat::Structured,
            Value::Number(_) => {}
            Value::String(s) => {
                all_numeric = false;
                long |= s.chars().count() > DEFAULT_TRUNCATE_CHARS;
            }
            _ => all_numeric = false,
        }
    }
    if long {
        ColumnFormat::ShortText {
            max_chars: DEFAULT_TRUNCATE_CHARS,
        }
    } else if any && all_numeric && base.is_empty() {
        ColumnFormat::Number
    } else {
        ColumnFormat::Text
    }
}

fn unwrap_type(data_type: &str) -> &str {
    let mut current = data_type.trim();
    for wrapper in ["Nullable(", "LowCardinality("] {
        if let Some(inner) = current.strip_prefix(wrapper).and_then(|s| s.strip_suffix(')')) {
            current = unwrap_type(inner);
        }
    }
    current
}

fn is_numeric_type(base: &str) -> bool {
    ["UInt", "Int", "Float", "Decimal"]
        .iter()
        .any(|prefix| base.starts_with(prefix))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn keyword(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct SortState {
    pub column: Option<String>,
    pub order: Option<SortOrder>,
}

impl SortState {
    /// Header click: asc → desc → unsorted on the same column, asc on a new one.
    pub fn cycle(&mut self, column: &str) {
        let same = self.column.as_deref() == Some(column);
        let next = match (same, self.order) {
            (true, Some(SortOrder::Asc)) => Some(SortOrder::Desc),
            (true, Some(SortOrder::Desc)) => None,
            _ => Some(SortOrder::Asc),
        };
        self.order = next;
        self.column = next.map(|_| column.to_string());
    }

    pub fn active(&self) -> Option<(&str, SortOrder)> {
        match (&self.column, self.order) {
            (Some(column), Some(order)) => Some((column.as_str(), order)),
            _ => None,
        }
    }
}

/// Replace, insert (before the first trailing LIMIT/SETTINGS/FORMAT) or
/// append the top-level ORDER BY clause; `None` removes any existing clause.
/// Clauses nested in parentheses, literals or comments are left alone.
pub fn rewrite_order_by(sql: &str, sort: Option<(&str, SortOrder)>) -> String {
    let body = sql.trim_end().trim_end_matches(';').trim_end();
    let clause = sort.map(|(column, order)| {
        format!("ORDER BY {} {}", quote_identifier(column), order.keyword())
    });

    let top_level = top_level_mask(body);
    let first_trailing = |from: usize| {
        TRAILING_CLAUSE
            .find_iter(&body[from..])
            .map(|m| from + m.start())
            .find(|at| top_level[*at])
    };

    let existing = ORDER_BY
        .find_iter(body)
        .filter(|m| top_level[m.start()])
        .last();
    let (before, after) = if let Some(existing) = existing {
        let end = first_trailing(existing.end()).unwrap_or(body.len());
        (&body[..existing.start()], &body[end..])
    } else if let Some(at) = first_trailing(0) {
        (&body[..at], &body[at..])
    } else {
        (body, "")
    };

    [before.trim_end(), clause.as_deref().unwrap_or(""), after.trim_start()]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Backquoted ClickHouse identifier.
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('\\', "\\\\").replace('`', "\\`"))
}

/// Per byte: true when it is plain SQL outside any parentheses, quotes
/// and comments.
fn top_level_mask(sql: &str) -> Vec<bool> {
    let bytes = sql.as_bytes();
    let mut mask = vec![false; bytes.len()];
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if let Some(q) = quote {
            if b == b'\\' {
                i += 2;
                continue;
            }
            if b == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match b {
            b'\'' | b'"' | b'`' => quote = Some(b),
            b'(' => depth += 1,
            b')' => depth = depth.saturating_sub(1),
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
                continue;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i < bytes.len() && !(bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/')) {
                    i += 1;
                }
                i += 2;
                continue;
            }
            _ => mask[i] = depth == 0,
        }
        i += 1;
    }
    mask
}

/// Stable local sort; nulls compare as empty strings.
pub fn sort_rows(rows: &mut [Row], column: &TableColumn, order: SortOrder) {
    let numeric_column = column.format.is_numeric();
    rows.sort_by(|a, b| {
        let left = a.get(&column.name).unwrap_or(&Value::Null);
        let right = b.get(&column.name).unwrap_or(&Value::Null);
        let ordering = if numeric_column {
            compare_numeric(left, right)
        } else {
            compare_text(left, right)
        };
        match order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    });
}

fn compare_numeric(left: &Value, right: &Value) -> Ordering {
    match (numeric(left), numeric(right)) {
        (Some(l), Some(r)) => l.partial_cmp(&r).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => compare_text(left, right),
    }
}

fn compare_text(left: &Value, right: &Value) -> Ordering {
    let (l, r) = (plain(left), plain(right));
    l.to_lowercase()
        .cmp(&r.to_lowercase())
        .then_with(|| l.cmp(&r))
}

/// Rows to materialise for the given viewport.
pub fn visible_rows(total: usize, first_visible: usize, viewport: usize) -> Range<usize> {
    if total <= VIRTUALIZATION_THRESHOLD {
        return 0..total;
    }
    let first = first_visible.min(total);
    let start = first.saturating_sub(OVERSCAN_ROWS);
    let end = first
        .saturating_add(viewport)
        .saturating_add(OVERSCAN_ROWS)
        .min(total);
    start..end
}

/// Pivot the first row into `name` / `value` rows.
pub fn transpose(result: &QueryResult) -> QueryResult {
    let Some(first) = result.rows.first() else {
        return QueryResult::new(transposed_columns(), Vec::new());
    };
    let rows = result
        .columns
        .iter()
        .map(|column| {
            let mut row = Row::new();
            row.insert("name".to_string(), Value::String(column.name.clone()));
            let value = first.get(&column.name).cloned().unwrap_or(Value::Null);
            row.insert("value".to_string(), value);
            row
        })
        .collect();
    QueryResult::new(transposed_columns(), rows)
}

fn transposed_columns() -> Vec<ColumnMeta> {
    vec![ColumnMeta::new("name", "String"), ColumnMeta::new("value", "")]
}

/// Renders interactive action cells; supplied by whoever displays the table.
pub trait ActionRenderer {
    fn render(&self, action: &str, row: &Row) -> Value;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RenderedCell {
    Text(String),
    Action(Value),
}

pub fn render_rows(
    rows: &[Row],
    columns: &[TableColumn],
    range: Range<usize>,
    actions: &dyn ActionRenderer,
) -> Vec<Vec<RenderedCell>> {
    let range = range.start.min(rows.len())..range.end.min(rows.len());
    rows[range]
        .iter()
        .map(|row| {
            columns
                .iter()
                .map(|column| match &column.kind {
                    ColumnKind::Data => RenderedCell::Text(
                        column
                            .format
                            .format(row.get(&column.name).unwrap_or(&Value::Null)),
                    ),
                    ColumnKind::Action { action } => RenderedCell::Action(actions.render(action, row)),
                })
                .collect()
        })
        .collect()
}

/// Display state of the loading skeleton.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SkeletonPhase {
    Hidden,
    Visible,
    FadingOut,
}

/// Shows a skeleton only until the first data arrives, holding it for a
/// minimum time and fading it out.
#[derive(Debug, Clone, Default)]
pub struct LoadingIndicator {
    has_data: bool,
    shown_at: Option<Instant>,
    settled_at: Option<Instant>,
}

impl LoadingIndicator {
    pub fn on_fetch_started(&mut self, now: Instant) {
        if self.has_data {
            return;
        }
        if self.shown_at.is_none() || self.settled_at.is_some() {
            self.shown_at = Some(now);
            self.settled_at = None;
        }
    }

    pub fn on_settled(&mut self, now: Instant, produced_data: bool) {
        self.has_data |= produced_data;
        if self.shown_at.is_some() && self.settled_at.is_none() {
            self.settled_at = Some(now);
        }
    }

    pub fn phase(&self, now: Instant) -> SkeletonPhase {
        let Some(shown) = self.shown_at else {
            return SkeletonPhase::Hidden;
        };
        let Some(settled) = self.settled_at else {
            return SkeletonPhase::Visible;
        };
        let hide_at = settled.max(shown + SKELETON_MIN_VISIBLE);
        if now < hide_at {
            SkeletonPhase::Visible
        } else if now < hide_at + SKELETON_FADE {
            SkeletonPhase::FadingOut
        } else {
            SkeletonPhase::Hidden
        }
    }
}
