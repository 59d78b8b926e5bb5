// Mapper from table windows to display rows
use crate::application::panel_runtime::TableWindow;
use crate::application::table_pipeline::{self, ActionRenderer, RenderedCell, TableColumn};
use crate::domain::query_result::Row;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Action cells become descriptors a client can post back as drilldown parameters.
pub struct DrilldownActionRenderer;

impl ActionRenderer for DrilldownActionRenderer {
    fn render(&self, action: &str, row: &Row) -> Value {
        let parameters: BTreeMap<&str, String> = row
            .iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(name, value)| {
                let text = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (name.as_str(), text)
            })
            .collect();
        serde_json::json!({ "action": action, "parameters": parameters })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableRows {
    pub columns: Vec<TableColumn>,
    pub total_rows: usize,
    pub start: usize,
    pub rows: Vec<Vec<RenderedCell>>,
}

pub fn table_window_to_rows(window: TableWindow) -> TableRows {
    let rows = table_pipeline::render_rows(
        &window.rows,
        &window.columns,
        0..window.rows.len(),
        &DrilldownActionRenderer,
    );
    TableRows {
        columns: window.columns,
        total_rows: window.total_rows,
        start: window.start,
        rows,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::table_pipeline::build_columns;
    use crate::domain::panel::{FieldOption, RowAction};
    use crate::domain::query_result::ColumnMeta;

    #[test]
    fn test_rows_are_formatted_and_actions_rendered() {
        let rows: Vec<Row> = vec![serde_json::json!({"query_id": "q1", "read_bytes": 2048})]
            .into_iter()
            .filter_map(|v| v.as_object().cloned())
            .collect();
        let field_options = vec![FieldOption {
            name: "read_bytes".to_string(),
            title: None,
            format: Some(crate::domain::format::ColumnFormat::Bytes),
            position: None,
            sortable: Some(true),
            width: None,
        }];
        let actions = vec![RowAction {
            name: "kill".to_string(),
            title: "Kill".to_string(),
        }];
        let meta = vec![ColumnMeta::new("query_id", "String"), ColumnMeta::new("read_bytes", "UInt64")];
        let columns = build_columns(&meta, &rows, &field_options, &actions);

        let mapped = table_window_to_rows(TableWindow {
            columns,
            total_rows: 1,
            start: 0,
            rows,
        });
        assert_eq!(mapped.rows[0][0], RenderedCell::Text("q1".to_string()));
        assert_eq!(mapped.rows[0][1], RenderedCell::Text("2.00 KiB".to_string()));
        assert_eq!(
            mapped.rows[0][2],
            RenderedCell::Action(serde_json::json!({
                "action": "kill",
                "parameters": {"query_id": "q1", "read_bytes": "2048"}
            }))
        );
    }
}
