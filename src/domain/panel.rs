// Panel domain model - one closed variant per panel kind
use super::format::ColumnFormat;
use super::schema::{
    ActionSchema, FieldOptionSchema, GridPos, PanelSchema, PanelType, QuerySchema,
};
use serde::Serialize;
use std::collections::BTreeMap;

pub const GRID_COLUMNS: u32 = 24;
pub const COLLAPSED_HEIGHT: u32 = 1;

/// Query descriptor handed to the execution service.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Query {
    pub text: String,
    pub parameters: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_text(&self, text: String) -> Self {
        Self {
            text,
            parameters: self.parameters.clone(),
            headers: self.headers.clone(),
        }
    }
}

impl From<QuerySchema> for Query {
    fn from(schema: QuerySchema) -> Self {
        Self {
            text: schema.sql,
            parameters: schema.parameters,
            headers: schema.headers,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldOption {
    pub name: String,
    pub title: Option<String>,
    pub format: Option<ColumnFormat>,
    pub position: Option<i32>,
    pub sortable: Option<bool>,
    pub width: Option<u32>,
}

impl From<FieldOptionSchema> for FieldOption {
    fn from(schema: FieldOptionSchema) -> Self {
        let format = schema.format.as_deref().and_then(|name| {
            let format = ColumnFormat::from_name(name);
            if format.is_none() {
                tracing::warn!("Unknown format {} for column {}", name, schema.name);
            }
            format
        });
        Self {
            name: schema.name,
            title: schema.title,
            format,
            position: schema.position,
            sortable: schema.sortable,
            width: schema.width,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowAction {
    pub name: String,
    pub title: String,
}

impl From<ActionSchema> for RowAction {
    fn from(schema: ActionSchema) -> Self {
        let title = schema.title.unwrap_or_else(|| schema.name.clone());
        Self {
            name: schema.name,
            title,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ChartOptions {
    pub unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct StatOptions {
    pub field_options: Vec<FieldOption>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct GaugeOptions {
    pub unit: Option<String>,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct TableOptions {
    pub field_options: Vec<FieldOption>,
    pub server_side_sorting: bool,
    pub actions: Vec<RowAction>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PanelKind {
    Line(ChartOptions),
    Bar(ChartOptions),
    Area(ChartOptions),
    Stat(StatOptions),
    Gauge(GaugeOptions),
    Table(TableOptions),
    TransposeTable(TableOptions),
}

impl PanelKind {
    /// Panels backed by a chart engine that can take part in linking.
    pub fn is_chart(&self) -> bool {
        match self {
            PanelKind::Line(_) | PanelKind::Bar(_) | PanelKind::Area(_) | PanelKind::Gauge(_) => true,
            PanelKind::Stat(_) | PanelKind::Table(_) | PanelKind::TransposeTable(_) => false,
        }
    }

    pub fn table_options(&self) -> Option<&TableOptions> {
        match self {
            PanelKind::Table(options) | PanelKind::TransposeTable(options) => Some(options),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PanelKind::Line(_) => "line",
            PanelKind::Bar(_) => "bar",
            PanelKind::Area(_) => "area",
            PanelKind::Stat(_) => "stat",
            PanelKind::Gauge(_) => "gauge",
            PanelKind::Table(_) => "table",
            PanelKind::TransposeTable(_) => "transpose-table",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Drilldown {
    pub name: String,
    pub panel: Box<Panel>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Panel {
    pub title: String,
    pub grid_pos: GridPos,
    pub collapsed: bool,
    pub query: Option<Query>,
    pub drilldown: Vec<Drilldown>,
    #[serde(flatten)]
    pub kind: PanelKind,
}

impl Panel {
    /// Build from a migrated schema entry; a missing `gridPos` gets the defaults.
    pub fn from_schema(schema: PanelSchema) -> Self {
        let grid_pos = schema.grid_pos.unwrap_or(GridPos {
            w: GRID_COLUMNS,
            h: default_height(schema.panel_type),
            x: None,
            y: None,
        });

        let field_options: Vec<FieldOption> =
            schema.field_options.into_iter().map(FieldOption::from).collect();

        let kind = match schema.panel_type {
            PanelType::Line => PanelKind::Line(ChartOptions { unit: schema.unit }),
            PanelType::Bar => PanelKind::Bar(ChartOptions { unit: schema.unit }),
            PanelType::Area => PanelKind::Area(ChartOptions { unit: schema.unit }),
            PanelType::Stat => PanelKind::Stat(StatOptions { field_options }),
            PanelType::Gauge => PanelKind::Gauge(GaugeOptions {
                unit: schema.unit,
                min: schema.min.unwrap_or(0.0),
                max: schema.max.unwrap_or(100.0),
            }),
            PanelType::Table | PanelType::TransposeTable => {
                let options = TableOptions {
                    field_options,
                    server_side_sorting: schema.server_side_sorting,
                    actions: schema.actions.into_iter().map(RowAction::from).collect(),
                };
                if schema.panel_type == PanelType::Table {
                    PanelKind::Table(options)
                } else {
                    PanelKind::TransposeTable(options)
                }
            }
        };

        let drilldown = schema
            .drilldown
            .into_iter()
            .map(|(name, panel)| Drilldown {
                name,
                panel: Box::new(Panel::from_schema(panel)),
            })
            .collect();

        Self {
            title: schema.title,
            grid_pos,
            collapsed: schema.collapsed,
            query: schema.query.map(Query::from),
            drilldown,
            kind,
        }
    }

    pub fn is_chart(&self) -> bool {
        self.kind.is_chart()
    }

    pub fn find_drilldown(&self, name: &str) -> Option<&Panel> {
        self.drilldown
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.panel.as_ref())
    }

    /// Height in grid rows given the panel's own collapse state.
    pub fn row_span(&self, collapsed: bool) -> u32 {
        if collapsed {
            COLLAPSED_HEIGHT
        } else {
            self.grid_pos.h.max(1)
        }
    }
}

/// Height used when a panel has no explicit `gridPos`.
pub fn default_height(panel_type: PanelType) -> u32 {
    match panel_type {
        PanelType::Table | PanelType::TransposeTable => 8,
        PanelType::Stat => 3,
        PanelType::Line | PanelType::Bar | PanelType::Area | PanelType::Gauge => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_schema_dispatches_on_type() {
        let schema: PanelSchema = serde_json::from_str(
            r#"{
                "type": "table",
                "title": "Running queries",
                "serverSideSorting": true,
                "query": {"sql": "SELECT 1"},
                "fieldOptions": [{"name": "elapsed", "format": "second", "position": 1}],
                "actions": [{"name": "kill", "title": "Kill"}],
                "drilldown": {"detail": {"type": "transpose-table", "query": {"sql": "SELECT 2"}}}
            }"#,
        )
        .unwrap();
        let panel = Panel::from_schema(schema);

        let options = panel.kind.table_options().unwrap();
        assert!(options.server_side_sorting);
        assert_eq!(options.field_options[0].format, Some(ColumnFormat::Seconds));
        assert_eq!(options.actions[0].title, "Kill");
        assert!(!panel.is_chart());
        assert_eq!(panel.grid_pos, GridPos { w: 24, h: 8, x: None, y: None });

        let detail = panel.find_drilldown("detail").unwrap();
        assert_eq!(detail.kind.name(), "transpose-table");
        assert_eq!(detail.query.as_ref().unwrap().text, "SELECT 2");
    }

    #[test]
    fn test_collapsed_row_span() {
        let panel = Panel::from_schema(PanelSchema {
            panel_type: PanelType::Line,
            ..Default::default()
        });
        assert!(panel.is_chart());
        assert_eq!(panel.row_span(false), 4);
        assert_eq!(panel.row_span(true), COLLAPSED_HEIGHT);
    }
}
