// Schema migration - upgrades legacy width encodings to gridPos
use crate::domain::panel::{GRID_COLUMNS, default_height};
use crate::domain::schema::{
    CURRENT_SCHEMA_VERSION, DashboardSchema, EntrySchema, GridPos, PanelSchema,
};

/// How a document version encodes panel width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WidthEncoding {
    /// Version 1: `width` on a 4-column row.
    Quarters,
    /// Version 2 and later: `width` on the 24-column grid.
    TwentyFourths,
}

impl WidthEncoding {
    fn for_version(version: u32) -> Self {
        if version <= 1 {
            WidthEncoding::Quarters
        } else {
            WidthEncoding::TwentyFourths
        }
    }

    /// Grid columns for a legacy width; out-of-range or missing widths take
    /// the full row.
    fn grid_columns(self, width: Option<u32>) -> u32 {
        let (max, factor) = match self {
            WidthEncoding::Quarters => (4, 6),
            WidthEncoding::TwentyFourths => (GRID_COLUMNS, 1),
        };
        width
            .filter(|w| (1..=max).contains(w))
            .map(|w| w * factor)
            .unwrap_or(GRID_COLUMNS)
    }
}

/// Upgrade a document to the current grid-position model. The input is not
/// modified; panels that already carry `gridPos` keep it untouched.
pub fn migrate(document: &DashboardSchema) -> DashboardSchema {
    let mut migrated = document.clone();
    let encoding = WidthEncoding::for_version(document.version);

    let mut filled = 0usize;
    for entry in &mut migrated.charts {
        match entry {
            EntrySchema::Panel(panel) => filled += assign_grid_pos(panel, encoding),
            EntrySchema::Group(group) => {
                for panel in &mut group.charts {
                    filled += assign_grid_pos(panel, encoding);
                }
            }
        }
    }

    if document.version != CURRENT_SCHEMA_VERSION || filled > 0 {
        tracing::debug!(
            dashboard = %document.name,
            from = document.version,
            to = CURRENT_SCHEMA_VERSION,
            panels = filled,
            "Migrated dashboard layout"
        );
    }

    migrated.version = migrated.version.max(CURRENT_SCHEMA_VERSION);
    migrated
}

fn assign_grid_pos(panel: &mut PanelSchema, encoding: WidthEncoding) -> usize {
    let mut filled = 0;
    if panel.grid_pos.is_none() {
        panel.grid_pos = Some(GridPos {
            w: encoding.grid_columns(panel.width),
            h: default_height(panel.panel_type),
            x: None,
            y: None,
        });
        filled += 1;
    }
    for sub_panel in panel.drilldown.values_mut() {
        filled += assign_grid_pos(sub_panel, encoding);
    }
    filled
}
