// Dashboard session - one opened dashboard with its mounted panels
use crate::application::chart_linking::{ChartLinker, Interaction, LinkStatus};
use crate::application::layout::{self, Cell, CollapseState, LayoutItem, PanelRegistry};
use crate::application::migration::migrate;
use crate::application::panel_runtime::{
    PanelEvent, PanelRuntime, PanelSnapshot, SortOutcome, TableWindow,
};
use crate::application::query_executor::QueryExecutor;
use crate::application::refresh_coordinator::{
    Clock, FILTER_DEBOUNCE, FilterDebouncer, RefreshCoordinator, RefreshablePanel,
};
use crate::domain::dashboard::Dashboard;
use crate::domain::refresh::{InputFilter, RefreshOptions, RefreshToken};
use crate::domain::schema::DashboardSchema;
use crate::domain::time_span::{TimeSpanSelection, default_time_span};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;
/// Open drilldowns per session; opening one more closes the oldest.
pub const MAX_DRILLDOWNS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("unknown panel {0}")]
    UnknownPanel(usize),
    #[error("unknown group {0}")]
    UnknownGroup(usize),
    #[error("panel {0} is not a table")]
    NotATable(usize),
    #[error("panel {panel} has no drilldown named {name}")]
    UnknownDrilldown { panel: usize, name: String },
    #[error("unknown drilldown session {0}")]
    UnknownDrilldownSession(u64),
    #[error("dashboard session is closed")]
    Closed,
}

/// Layout plus per-panel state, as handed to renderers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardView {
    pub name: String,
    pub title: String,
    pub version: u32,
    pub selected_span: Option<TimeSpanSelection>,
    pub items: Vec<LayoutItem>,
    pub cells: Vec<Option<Cell>>,
    pub panels: Vec<PanelSnapshot>,
    pub charts: LinkStatus,
}

/// A chart interaction mirrored to linked siblings.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkedInteraction {
    pub source: usize,
    pub targets: Vec<usize>,
    pub interaction: Interaction,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum DashboardEvent {
    Panel(PanelEvent),
    Interaction(LinkedInteraction),
}

struct Drilldown {
    runtime: PanelRuntime,
}

pub struct DashboardSession {
    dashboard: Dashboard,
    registry: PanelRegistry,
    coordinator: Arc<RefreshCoordinator>,
    debouncer: FilterDebouncer,
    panels: Vec<Arc<PanelRuntime>>,
    collapse: Mutex<CollapseState>,
    linker: Mutex<ChartLinker>,
    drilldowns: Mutex<HashMap<u64, Drilldown>>,
    next_drilldown: AtomicU64,
    executor: Arc<dyn QueryExecutor>,
    panel_events: broadcast::Sender<PanelEvent>,
    events: broadcast::Sender<DashboardEvent>,
    closed: Mutex<bool>,
}

impl DashboardSession {
    /// Migrate, lay out and mount every panel, then dispatch the initial
    /// refresh with the default span. Must run inside a tokio runtime.
    pub fn open(
        schema: &DashboardSchema,
        executor: Arc<dyn QueryExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let dashboard = Dashboard::from_schema(migrate(schema));
        let registry = PanelRegistry::build(&dashboard);
        let collapse = registry.initial_collapse_state();
        let coordinator = Arc::new(RefreshCoordinator::new());
        let (panel_events, _) = broadcast::channel(EVENT_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let panels: Vec<Arc<PanelRuntime>> = registry
            .panels()
            .iter()
            .map(|flat| {
                Arc::new(PanelRuntime::mount(
                    flat.index,
                    flat.panel.clone(),
                    executor.clone(),
                    panel_events.clone(),
                ))
            })
            .collect();

        let mut linker = ChartLinker::new(dashboard.name.clone(), registry.chart_count());
        for panel in &panels {
            coordinator.register(panel.clone());
            linker.relink(coordinator.chart_instances());
        }

        tracing::info!(
            dashboard = %dashboard.name,
            panels = panels.len(),
            groups = registry.groups().len(),
            "Opened dashboard session"
        );

        let session = Arc::new(Self {
            debouncer: FilterDebouncer::new(coordinator.clone(), clock.clone(), FILTER_DEBOUNCE),
            dashboard,
            registry,
            coordinator,
            panels,
            collapse: Mutex::new(collapse),
            linker: Mutex::new(linker),
            drilldowns: Mutex::new(HashMap::new()),
            next_drilldown: AtomicU64::new(1),
            executor,
            panel_events,
            events,
            closed: Mutex::new(false),
        });
        session.forward_panel_events();
        session.coordinator.refresh_all(None, clock.now());
        session
    }

    // Relay panel status changes onto the dashboard-wide event channel.
    fn forward_panel_events(self: &Arc<Self>) {
        let mut panel_events = self.panel_events.subscribe();
        let events = self.events.clone();
        let session = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                match panel_events.recv().await {
                    Ok(event) => {
                        let _ = events.send(DashboardEvent::Panel(event));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Panel event relay lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
                if session.upgrade().is_none() {
                    break;
                }
            }
        });
    }

    pub fn name(&self) -> &str {
        &self.dashboard.name
    }

    pub fn panel_count(&self) -> usize {
        self.panels.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DashboardEvent> {
        self.events.subscribe()
    }

    fn collapse(&self) -> MutexGuard<'_, CollapseState> {
        self.collapse.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if *self.closed.lock().unwrap_or_else(|p| p.into_inner()) {
            Err(SessionError::Closed)
        } else {
            Ok(())
        }
    }

    fn runtime(&self, index: usize) -> Result<&Arc<PanelRuntime>, SessionError> {
        self.panels.get(index).ok_or(SessionError::UnknownPanel(index))
    }

    /// Render order with packed cells; invisible items have no cell.
    pub fn layout(&self) -> (Vec<LayoutItem>, Vec<Option<Cell>>) {
        let items = self.registry.render_order(&self.collapse());
        let cells = layout::pack(&items);
        (items, cells)
    }

    pub fn view(&self) -> DashboardView {
        let (items, cells) = self.layout();
        DashboardView {
            name: self.dashboard.name.clone(),
            title: self.dashboard.title.clone(),
            version: self.dashboard.version,
            selected_span: self.coordinator.selected_span(),
            items,
            cells,
            panels: self.panels.iter().map(|p| p.snapshot()).collect(),
            charts: self.linker.lock().unwrap_or_else(|p| p.into_inner()).status(),
        }
    }

    pub fn panel_snapshot(&self, index: usize) -> Result<PanelSnapshot, SessionError> {
        Ok(self.runtime(index)?.snapshot())
    }

    /// Hide or show a group's panels. Members stay mounted, nothing is fetched.
    pub fn toggle_group(&self, group: usize) -> Result<bool, SessionError> {
        let collapsed = self
            .collapse()
            .toggle_group(group)
            .ok_or(SessionError::UnknownGroup(group))?;
        tracing::debug!(dashboard = %self.dashboard.name, group, collapsed, "Toggled group");
        Ok(collapsed)
    }

    pub fn toggle_panel(&self, panel: usize) -> Result<bool, SessionError> {
        self.collapse()
            .toggle_panel(panel)
            .ok_or(SessionError::UnknownPanel(panel))
    }

    /// Force `display: none` on a panel, or lift it. Nothing is fetched.
    pub fn set_panel_hidden(&self, panel: usize, hidden: bool) -> Result<bool, SessionError> {
        let hidden = self
            .collapse()
            .set_hidden(panel, hidden)
            .ok_or(SessionError::UnknownPanel(panel))?;
        tracing::debug!(dashboard = %self.dashboard.name, panel, hidden, "Set panel visibility");
        Ok(hidden)
    }

    pub fn select_time_span(&self, span: TimeSpanSelection, now: DateTime<Utc>) -> Result<RefreshOptions, SessionError> {
        self.ensure_open()?;
        self.coordinator.select_span(span);
        Ok(self.coordinator.refresh_all(None, now))
    }

    /// Span pushed by the embedding page; it wins over the selector until
    /// cleared. Every panel is refreshed with the resulting window.
    pub fn set_external_span(
        &self,
        span: Option<TimeSpanSelection>,
        now: DateTime<Utc>,
    ) -> Result<RefreshOptions, SessionError> {
        self.ensure_open()?;
        self.coordinator.set_external_span(span);
        Ok(self.coordinator.refresh_all(None, now))
    }

    /// Manual refresh; always observable even if the window is unchanged.
    pub fn refresh(&self, override_span: Option<TimeSpanSelection>, now: DateTime<Utc>) -> Result<RefreshOptions, SessionError> {
        self.ensure_open()?;
        Ok(self.coordinator.refresh_all(override_span, now))
    }

    /// Debounced; the refresh runs once typing settles.
    pub fn set_filter(&self, text: Option<String>) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.debouncer.schedule(text);
        Ok(())
    }

    pub fn sort_column(&self, panel: usize, column: &str) -> Result<SortOutcome, SessionError> {
        self.ensure_open()?;
        self.runtime(panel)?
            .sort_by(column)
            .ok_or(SessionError::NotATable(panel))
    }

    pub fn table_window(&self, panel: usize, first_visible: usize, viewport: usize) -> Result<TableWindow, SessionError> {
        self.runtime(panel)?
            .table_window(first_visible, viewport)
            .ok_or(SessionError::NotATable(panel))
    }

    /// Mirror a hover or zoom on one chart to its linked siblings.
    pub fn interact(&self, panel: usize, interaction: Interaction) -> Result<LinkedInteraction, SessionError> {
        let source = self.runtime(panel)?;
        let targets = match source.chart_instance() {
            Some(handle) => {
                let siblings = self.linker.lock().unwrap_or_else(|p| p.into_inner()).fan_out(handle);
                self.panels
                    .iter()
                    .filter(|p| p.chart_instance().is_some_and(|h| siblings.contains(&h)))
                    .map(|p| RefreshablePanel::index(p.as_ref()))
                    .collect()
            }
            None => Vec::new(),
        };
        let linked = LinkedInteraction {
            source: panel,
            targets,
            interaction,
        };
        let _ = self.events.send(DashboardEvent::Interaction(linked.clone()));
        Ok(linked)
    }

    /// Open a drilldown sub-panel with its own refresh lifecycle. Row values
    /// from the interaction become query parameters.
    pub fn open_drilldown(
        &self,
        panel: usize,
        name: &str,
        parameters: BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Result<(u64, PanelSnapshot), SessionError> {
        self.ensure_open()?;
        let parent = self.runtime(panel)?;
        let mut sub_panel = parent
            .panel()
            .find_drilldown(name)
            .cloned()
            .ok_or_else(|| SessionError::UnknownDrilldown {
                panel,
                name: name.to_string(),
            })?;
        if let Some(query) = sub_panel.query.as_mut() {
            query.parameters.extend(parameters);
        }

        let id = self.next_drilldown.fetch_add(1, Ordering::Relaxed);
        // Drilldowns live outside the flattened index space.
        let runtime = PanelRuntime::mount(
            self.panels.len() + id as usize,
            Arc::new(sub_panel),
            self.executor.clone(),
            self.panel_events.clone(),
        );
        // Same window and filter the parent was last fetched with.
        let options = parent.last_refresh_parameters().unwrap_or_else(|| {
            let span = self
                .coordinator
                .selected_span()
                .unwrap_or_else(|| TimeSpanSelection::Relative(default_time_span()));
            RefreshOptions::new(
                span.resolve(now),
                InputFilter {
                    token: RefreshToken {
                        issued_at_millis: now.timestamp_millis(),
                        sequence: 0,
                    },
                    text: None,
                },
            )
        });
        runtime.refresh(&options.forced());

        let snapshot = runtime.snapshot();
        tracing::debug!(dashboard = %self.dashboard.name, panel, drilldown = name, id, "Opened drilldown");
        let evicted = {
            let mut drilldowns = self.drilldowns.lock().unwrap_or_else(|p| p.into_inner());
            drilldowns.insert(id, Drilldown { runtime });
            let oldest = (drilldowns.len() > MAX_DRILLDOWNS)
                .then(|| drilldowns.keys().min().copied())
                .flatten();
            oldest.and_then(|oldest| drilldowns.remove(&oldest).map(|d| (oldest, d)))
        };
        if let Some((oldest, drilldown)) = evicted {
            tracing::debug!(dashboard = %self.dashboard.name, id = oldest, "Closed oldest drilldown");
            drilldown.runtime.unmount();
        }
        Ok((id, snapshot))
    }

    pub fn drilldown_snapshot(&self, id: u64) -> Result<PanelSnapshot, SessionError> {
        self.drilldowns
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&id)
            .map(|d| d.runtime.snapshot())
            .ok_or(SessionError::UnknownDrilldownSession(id))
    }

    pub fn close_drilldown(&self, id: u64) -> Result<(), SessionError> {
        let drilldown = self
            .drilldowns
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&id)
            .ok_or(SessionError::UnknownDrilldownSession(id))?;
        drilldown.runtime.unmount();
        Ok(())
    }

    /// Unmount everything; outstanding fetches are cancelled.
    pub fn close(&self) {
        {
            let mut closed = self.closed.lock().unwrap_or_else(|p| p.into_inner());
            if *closed {
                return;
            }
            *closed = true;
        }
        self.debouncer.cancel();
        let mut linker = self.linker.lock().unwrap_or_else(|p| p.into_inner());
        for panel in &self.panels {
            panel.unmount();
            self.coordinator.deregister(RefreshablePanel::index(panel.as_ref()));
            linker.relink(self.coordinator.chart_instances());
        }
        for (_, drilldown) in self.drilldowns.lock().unwrap_or_else(|p| p.into_inner()).drain() {
            drilldown.runtime.unmount();
        }
        tracing::info!(dashboard = %self.dashboard.name, "Closed dashboard session");
    }
}

impl Drop for DashboardSession {
    fn drop(&mut self) {
        self.close();
    }
}
