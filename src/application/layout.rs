// Panel registry and grid layout
use crate::domain::dashboard::{Dashboard, Entry};
use crate::domain::panel::{GRID_COLUMNS, Panel};
use serde::Serialize;
use std::sync::Arc;

/// Back-reference from a grouped panel to its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRef {
    pub group_index: usize,
    /// First flat index belonging to the group.
    pub first: usize,
    /// One past the last flat index belonging to the group.
    pub end: usize,
}

#[derive(Debug, Clone)]
pub struct FlatPanel {
    pub index: usize,
    pub panel: Arc<Panel>,
    pub group: Option<GroupRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupInfo {
    pub title: String,
    pub collapsed: bool,
    pub first: usize,
    pub end: usize,
}

/// Placement hints for a CSS-grid-like auto-flow engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GridPlacement {
    pub column_span: u32,
    pub row_span: u32,
    /// 1-based, present only when the panel declares `x`.
    pub column_start: Option<u32>,
    /// 1-based, present only when the panel declares `y`.
    pub row_start: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum LayoutItem {
    #[serde(rename_all = "camelCase")]
    GroupHeader {
        group_index: usize,
        title: String,
        collapsed: bool,
        placement: GridPlacement,
    },
    #[serde(rename_all = "camelCase")]
    Panel {
        panel_index: usize,
        visible: bool,
        collapsed: bool,
        placement: GridPlacement,
    },
}

impl LayoutItem {
    fn placement(&self) -> GridPlacement {
        match self {
            LayoutItem::GroupHeader { placement, .. } | LayoutItem::Panel { placement, .. } => *placement,
        }
    }

    fn is_visible(&self) -> bool {
        match self {
            LayoutItem::GroupHeader { .. } => true,
            LayoutItem::Panel { visible, .. } => *visible,
        }
    }
}

/// Absolute cell rectangle produced by [`pack`], 0-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Cell {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

/// Flattened panels and their groups for one dashboard.
#[derive(Debug, Clone)]
pub struct PanelRegistry {
    panels: Vec<FlatPanel>,
    groups: Vec<GroupInfo>,
    /// Entry order: `Ok(panel)` for standalone panels, `Err(group)` for groups.
    order: Vec<Result<usize, usize>>,
}

impl PanelRegistry {
    pub fn build(dashboard: &Dashboard) -> Self {
        let mut panels = Vec::with_capacity(dashboard.panel_count());
        let mut groups = Vec::new();
        let mut order = Vec::with_capacity(dashboard.entries.len());

        for entry in &dashboard.entries {
            match entry {
                Entry::Panel(panel) => {
                    order.push(Ok(panels.len()));
                    panels.push(FlatPanel {
                        index: panels.len(),
                        panel: Arc::new(panel.clone()),
                        group: None,
                    });
                }
                Entry::Group(group) => {
                    let group_index = groups.len();
                    let first = panels.len();
                    let end = first + group.panels.len();
                    for panel in &group.panels {
                        panels.push(FlatPanel {
                            index: panels.len(),
                            panel: Arc::new(panel.clone()),
                            group: Some(GroupRef {
                                group_index,
                                first,
                                end,
                            }),
                        });
                    }
                    groups.push(GroupInfo {
                        title: group.title.clone(),
                        collapsed: group.collapsed,
                        first,
                        end,
                    });
                    order.push(Err(group_index));
                }
            }
        }

        Self {
            panels,
            groups,
            order,
        }
    }

    pub fn panels(&self) -> &[FlatPanel] {
        &self.panels
    }

    pub fn panel(&self, index: usize) -> Option<&FlatPanel> {
        self.panels.get(index)
    }

    pub fn groups(&self) -> &[GroupInfo] {
        &self.groups
    }

    pub fn chart_count(&self) -> usize {
        self.panels.iter().filter(|p| p.panel.is_chart()).count()
    }

    /// Seed session collapse state from the schema. Called once per session.
    pub fn initial_collapse_state(&self) -> CollapseState {
        CollapseState {
            groups: self.groups.iter().map(|g| g.collapsed).collect(),
            panels: self.panels.iter().map(|p| p.panel.collapsed).collect(),
            hidden: vec![false; self.panels.len()],
        }
    }

    /// Render order: group headers interleaved with their members.
    pub fn render_order(&self, state: &CollapseState) -> Vec<LayoutItem> {
        let mut items = Vec::with_capacity(self.panels.len() + self.groups.len());
        for entry in &self.order {
            match *entry {
                Ok(index) => items.push(self.panel_item(index, state)),
                Err(group_index) => {
                    let group = &self.groups[group_index];
                    items.push(LayoutItem::GroupHeader {
                        group_index,
                        title: group.title.clone(),
                        collapsed: state.group_collapsed(group_index),
                        placement: GridPlacement {
                            column_span: GRID_COLUMNS,
                            row_span: 1,
                            column_start: None,
                            row_start: None,
                        },
                    });
                    for index in group.first..group.end {
                        items.push(self.panel_item(index, state));
                    }
                }
            }
        }
        items
    }

    fn panel_item(&self, index: usize, state: &CollapseState) -> LayoutItem {
        let flat = &self.panels[index];
        let collapsed = state.panel_collapsed(index);
        let grid = flat.panel.grid_pos;
        LayoutItem::Panel {
            panel_index: index,
            visible: state.is_visible(index, flat.group.as_ref()),
            collapsed,
            placement: GridPlacement {
                column_span: grid.w.clamp(1, GRID_COLUMNS),
                row_span: flat.panel.row_span(collapsed),
                column_start: grid.x.map(|x| x + 1),
                row_start: grid.y.map(|y| y + 1),
            },
        }
    }
}

/// Session-owned collapse and visibility flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollapseState {
    groups: Vec<bool>,
    panels: Vec<bool>,
    hidden: Vec<bool>,
}

impl CollapseState {
    pub fn group_collapsed(&self, group: usize) -> bool {
        self.groups.get(group).copied().unwrap_or(false)
    }

    pub fn panel_collapsed(&self, panel: usize) -> bool {
        self.panels.get(panel).copied().unwrap_or(false)
    }

    /// Returns the new state, or None for an unknown group.
    pub fn toggle_group(&mut self, group: usize) -> Option<bool> {
        let flag = self.groups.get_mut(group)?;
        *flag = !*flag;
        Some(*flag)
    }

    pub fn toggle_panel(&mut self, panel: usize) -> Option<bool> {
        let flag = self.panels.get_mut(panel)?;
        *flag = !*flag;
        Some(*flag)
    }

    /// Force `display: none` on a panel regardless of its group.
    /// None for an unknown panel.
    pub fn set_hidden(&mut self, panel: usize, hidden: bool) -> Option<bool> {
        let flag = self.hidden.get_mut(panel)?;
        *flag = hidden;
        Some(hidden)
    }

    pub fn is_visible(&self, panel: usize, group: Option<&GroupRef>) -> bool {
        let forced_hidden = self.hidden.get(panel).copied().unwrap_or(false);
        let group_collapsed = group.is_some_and(|g| self.group_collapsed(g.group_index));
        !forced_hidden && !group_collapsed
    }
}

/// Row-major auto-flow over the grid. Explicit coordinates are honoured,
/// invisible items take no space.
pub fn pack(items: &[LayoutItem]) -> Vec<Option<Cell>> {
    let mut occupied: Vec<Vec<bool>> = Vec::new();
    let mut cursor = (0u32, 0u32);
    let mut cells = Vec::with_capacity(items.len());

    for item in items {
        if !item.is_visible() {
            cells.push(None);
            continue;
        }
        let placement = item.placement();
        let w = placement.column_span.clamp(1, GRID_COLUMNS);
        let h = placement.row_span.max(1);

        let cell = match (placement.column_start, placement.row_start) {
            (Some(col), Some(row)) => Cell {
                x: (col - 1).min(GRID_COLUMNS - w),
                y: row - 1,
                w,
                h,
            },
            (col, _) => {
                let fixed_x = col.map(|c| (c - 1).min(GRID_COLUMNS - w));
                let (x, y) = find_slot(&occupied, cursor, w, h, fixed_x);
                cursor = (x + w, y);
                Cell { x, y, w, h }
            }
        };
        mark(&mut occupied, &cell);
        cells.push(Some(cell));
    }
    cells
}

fn find_slot(
    occupied: &[Vec<bool>],
    cursor: (u32, u32),
    w: u32,
    h: u32,
    fixed_x: Option<u32>,
) -> (u32, u32) {
    let (mut x, mut y) = cursor;
    loop {
        if let Some(fx) = fixed_x {
            if x > fx {
                y += 1;
            }
            x = fx;
        }
        if x + w > GRID_COLUMNS {
            x = 0;
            y += 1;
            continue;
        }
        if is_free(occupied, x, y, w, h) {
            return (x, y);
        }
        if fixed_x.is_some() {
            y += 1;
        } else {
            x += 1;
        }
    }
}

fn is_free(occupied: &[Vec<bool>], x: u32, y: u32, w: u32, h: u32) -> bool {
    (y..y + h).all(|row| {
        occupied
            .get(row as usize)
            .is_none_or(|cols| (x..x + w).all(|col| !cols[col as usize]))
    })
}

fn mark(occupied: &mut Vec<Vec<bool>>, cell: &Cell) {
    let bottom = (cell.y + cell.h) as usize;
    if occupied.len() < bottom {
        occupied.resize(bottom, vec![false; GRID_COLUMNS as usize]);
    }
    for row in cell.y..cell.y + cell.h {
        for col in cell.x..cell.x + cell.w {
            occupied[row as usize][col as usize] = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::migration::migrate;
    use crate::domain::schema::DashboardSchema;
    use serde_json::json;

    fn registry(value: serde_json::Value) -> PanelRegistry {
        let schema: DashboardSchema = serde_json::from_value(value).unwrap();
        PanelRegistry::build(&Dashboard::from_schema(migrate(&schema)))
    }

    fn sample() -> PanelRegistry {
        registry(json!({
            "version": 3,
            "charts": [
                {"type": "stat", "title": "uptime", "gridPos": {"w": 6, "h": 3}},
                {"title": "Queries", "charts": [
                    {"type": "line", "gridPos": {"w": 12, "h": 4}},
                    {"type": "bar", "gridPos": {"w": 12, "h": 4}},
                    {"type": "table", "collapsed": true, "gridPos": {"w": 24, "h": 8}}
                ]},
                {"type": "gauge", "gridPos": {"w": 6, "h": 4}}
            ]
        }))
    }

    #[test]
    fn test_flatten_assigns_stable_indices_and_group_refs() {
        let registry = sample();
        let panels = registry.panels();
        assert_eq!(panels.len(), 5);
        assert!(panels[0].group.is_none());
        assert_eq!(panels[2].group, Some(GroupRef { group_index: 0, first: 1, end: 4 }));
        assert_eq!(panels[4].index, 4);
        assert_eq!(registry.chart_count(), 3);
    }

    #[test]
    fn test_render_order_interleaves_group_headers() {
        let registry = sample();
        let state = registry.initial_collapse_state();
        let items = registry.render_order(&state);
        assert_eq!(items.len(), 6);
        assert!(matches!(items[1], LayoutItem::GroupHeader { group_index: 0, .. }));
        match &items[4] {
            LayoutItem::Panel { panel_index, collapsed, placement, .. } => {
                assert_eq!(*panel_index, 3);
                assert!(*collapsed);
                assert_eq!(placement.row_span, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_group_collapse_hides_members_only() {
        let registry = sample();
        let mut state = registry.initial_collapse_state();
        assert_eq!(state.toggle_group(0), Some(true));

        let visible: Vec<bool> = registry
            .render_order(&state)
            .iter()
            .filter_map(|item| match item {
                LayoutItem::Panel { visible, .. } => Some(*visible),
                _ => None,
            })
            .collect();
        assert_eq!(visible, vec![true, false, false, false, true]);

        // Panel collapse is independent of the group.
        assert!(state.panel_collapsed(3));
        assert_eq!(state.toggle_group(0), Some(false));
        assert!(state.panel_collapsed(3));
        assert_eq!(state.toggle_group(9), None);
    }

    #[test]
    fn test_forced_hidden() {
        let registry = sample();
        let mut state = registry.initial_collapse_state();
        assert_eq!(state.set_hidden(0, true), Some(true));
        assert!(!state.is_visible(0, None));
        assert_eq!(state.set_hidden(0, false), Some(false));
        assert!(state.is_visible(0, None));
        assert_eq!(state.set_hidden(99, true), None);
    }

    #[test]
    fn test_pack_auto_flow() {
        let registry = sample();
        let state = registry.initial_collapse_state();
        let cells = pack(&registry.render_order(&state));

        assert_eq!(cells[0], Some(Cell { x: 0, y: 0, w: 6, h: 3 }));
        // Group header spans a full row below the stat.
        assert_eq!(cells[1], Some(Cell { x: 0, y: 3, w: 24, h: 1 }));
        assert_eq!(cells[2], Some(Cell { x: 0, y: 4, w: 12, h: 4 }));
        assert_eq!(cells[3], Some(Cell { x: 12, y: 4, w: 12, h: 4 }));
        assert_eq!(cells[4], Some(Cell { x: 0, y: 8, w: 24, h: 1 }));
        assert_eq!(cells[5], Some(Cell { x: 0, y: 9, w: 6, h: 4 }));
    }

    #[test]
    fn test_pack_honours_explicit_position_and_skips_hidden() {
        let registry = registry(json!({
            "version": 3,
            "charts": [
                {"type": "line", "gridPos": {"w": 6, "h": 2, "x": 18, "y": 0}},
                {"type": "line", "gridPos": {"w": 6, "h": 2}},
                {"title": "g", "collapsed": true, "charts": [{"type": "bar", "gridPos": {"w": 24, "h": 4}}]}
            ]
        }));
        let state = registry.initial_collapse_state();
        let cells = pack(&registry.render_order(&state));
        assert_eq!(cells[0], Some(Cell { x: 18, y: 0, w: 6, h: 2 }));
        assert_eq!(cells[1], Some(Cell { x: 0, y: 0, w: 6, h: 2 }));
        assert_eq!(cells[2], Some(Cell { x: 0, y: 2, w: 24, h: 1 }));
        assert_eq!(cells[3], None);
    }
}
