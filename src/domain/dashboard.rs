// Dashboard domain model
use super::panel::Panel;
use super::schema::{DashboardSchema, EntrySchema};

#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub title: String,
    pub collapsed: bool,
    pub panels: Vec<Panel>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    Panel(Panel),
    Group(Group),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dashboard {
    pub name: String,
    pub title: String,
    pub version: u32,
    pub entries: Vec<Entry>,
}

impl Dashboard {
    /// Expects a document that has already been migrated.
    pub fn from_schema(schema: DashboardSchema) -> Self {
        let entries = schema
            .charts
            .into_iter()
            .map(|entry| match entry {
                EntrySchema::Panel(panel) => Entry::Panel(Panel::from_schema(panel)),
                EntrySchema::Group(group) => Entry::Group(Group {
                    title: group.title,
                    collapsed: group.collapsed,
                    panels: group.charts.into_iter().map(Panel::from_schema).collect(),
                }),
            })
            .collect();

        Self {
            name: schema.name,
            title: schema.title,
            version: schema.version,
            entries,
        }
    }

    pub fn panel_count(&self) -> usize {
        self.entries
            .iter()
            .map(|entry| match entry {
                Entry::Panel(_) => 1,
                Entry::Group(group) => group.panels.len(),
            })
            .sum()
    }
}
