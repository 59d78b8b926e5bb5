// Per-panel refresh state machine and data ownership
use crate::application::chart_linking::ChartInstanceHandle;
use crate::application::query_executor::{QueryError, QueryExecutor};
use crate::application::query_template::substitute_time_placeholders;
use crate::application::refresh_coordinator::RefreshablePanel;
use crate::application::table_pipeline::{
    self, ColumnKind, LoadingIndicator, SkeletonPhase, SortState, TableColumn,
};
use crate::domain::panel::{Panel, PanelKind, Query, StatOptions};
use crate::domain::query_result::{QueryResult, Row};
use crate::domain::refresh::RefreshOptions;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Query parameter carrying the ad-hoc filter text.
pub const FILTER_PARAMETER: &str = "filter";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PanelStatus {
    Idle,
    Loading,
    Ready,
    Failed,
}

/// Errors that stay inside the panel that produced them.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PanelError {
    #[error("panel has no query defined")]
    MissingQuery,
    #[error("{0}")]
    Query(QueryError),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PanelEvent {
    pub panel: usize,
    pub status: PanelStatus,
    pub generation: u64,
}

/// Outcome of a header click on a table panel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "sort", rename_all = "camelCase")]
pub enum SortOutcome {
    /// Server-side sorting: the query was rewritten and one refresh dispatched.
    Refetching(SortState),
    /// Local sorting: rows were reordered in place.
    Resorted(SortState),
    NotSortable,
}

#[derive(Debug, Clone, Default)]
struct TableView {
    columns: Vec<TableColumn>,
    rows: Vec<Row>,
    sort: SortState,
}

struct PanelState {
    mounted: bool,
    status: PanelStatus,
    generation: u64,
    in_flight: Option<CancellationToken>,
    last_applied: Option<RefreshOptions>,
    result: Option<Arc<QueryResult>>,
    error: Option<PanelError>,
    table: Option<TableView>,
    loading: LoadingIndicator,
    fetches: u64,
}

struct PanelShared {
    index: usize,
    panel: Arc<Panel>,
    executor: Arc<dyn QueryExecutor>,
    events: broadcast::Sender<PanelEvent>,
    state: Mutex<PanelState>,
}

/// Read-only view of a panel for renderers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PanelSnapshot {
    pub index: usize,
    pub title: String,
    pub kind: &'static str,
    pub status: PanelStatus,
    pub error: Option<String>,
    pub skeleton: SkeletonPhase,
    pub fetches: u64,
    pub last_refresh: Option<RefreshOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<TableColumn>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<SortState>,
    pub row_count: usize,
    /// Formatted headline value of a stat panel.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stat: Option<String>,
    /// Raw result for charts, stats and gauges; tables are read through windows.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Arc<QueryResult>>,
}

/// Rows of a table panel prepared for display.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableWindow {
    pub columns: Vec<TableColumn>,
    pub total_rows: usize,
    pub start: usize,
    pub rows: Vec<Row>,
}

/// A mounted panel. Dropping it cancels any outstanding fetch.
pub struct PanelRuntime {
    shared: Arc<PanelShared>,
    mount_token: CancellationToken,
    chart: Option<ChartInstanceHandle>,
}

impl PanelRuntime {
    pub fn mount(
        index: usize,
        panel: Arc<Panel>,
        executor: Arc<dyn QueryExecutor>,
        events: broadcast::Sender<PanelEvent>,
    ) -> Self {
        let chart = panel.is_chart().then(ChartInstanceHandle::allocate);
        let table = panel.kind.table_options().map(|_| TableView::default());
        tracing::debug!(panel = index, kind = panel.kind.name(), "Mounting panel");

        Self {
            shared: Arc::new(PanelShared {
                index,
                panel,
                executor,
                events,
                state: Mutex::new(PanelState {
                    mounted: true,
                    status: PanelStatus::Idle,
                    generation: 0,
                    in_flight: None,
                    last_applied: None,
                    result: None,
                    error: None,
                    table,
                    loading: LoadingIndicator::default(),
                    fetches: 0,
                }),
            }),
            mount_token: CancellationToken::new(),
            chart,
        }
    }

    pub fn panel(&self) -> &Panel {
        &self.shared.panel
    }

    /// Cancel outstanding work; late completions are discarded.
    pub fn unmount(&self) {
        {
            let mut state = self.shared.lock();
            if !state.mounted {
                return;
            }
            state.mounted = false;
            state.in_flight = None;
            state.status = PanelStatus::Idle;
        }
        self.mount_token.cancel();
        tracing::debug!(panel = self.shared.index, "Unmounted panel");
    }

    pub fn is_mounted(&self) -> bool {
        self.shared.lock().mounted
    }

    pub fn status(&self) -> PanelStatus {
        self.shared.lock().status
    }

    pub fn fetch_count(&self) -> u64 {
        self.shared.lock().fetches
    }

    pub fn snapshot(&self) -> PanelSnapshot {
        let state = self.shared.lock();
        let panel = &self.shared.panel;
        let is_table = state.table.is_some();
        PanelSnapshot {
            index: self.shared.index,
            title: panel.title.clone(),
            kind: panel.kind.name(),
            status: state.status,
            error: state.error.as_ref().map(|e| e.to_string()),
            skeleton: state.loading.phase(Instant::now()),
            fetches: state.fetches,
            last_refresh: state.last_applied.clone(),
            columns: state.table.as_ref().map(|t| t.columns.clone()),
            sort: state.table.as_ref().map(|t| t.sort.clone()),
            row_count: state.result.as_ref().map(|r| r.row_count).unwrap_or(0),
            stat: match (&panel.kind, &state.result) {
                (PanelKind::Stat(options), Some(result)) => stat_value(options, result),
                _ => None,
            },
            data: if is_table { None } else { state.result.clone() },
        }
    }

    /// Display rows `[first_visible - overscan, first_visible + viewport + overscan)`.
    pub fn table_window(&self, first_visible: usize, viewport: usize) -> Option<TableWindow> {
        let state = self.shared.lock();
        let table = state.table.as_ref()?;
        let range = table_pipeline::visible_rows(table.rows.len(), first_visible, viewport);
        Some(TableWindow {
            columns: table.columns.clone(),
            total_rows: table.rows.len(),
            start: range.start,
            rows: table.rows[range].to_vec(),
        })
    }

    /// Header click on a table column. Only sortable data columns of the
    /// current result are accepted, so a server-side sort always reuses the
    /// options that produced that result.
    pub fn sort_by(&self, column: &str) -> Option<SortOutcome> {
        let options = self.shared.panel.kind.table_options()?;
        let mut state = self.shared.lock();
        let last_applied = state.last_applied.clone();
        let table = state.table.as_mut()?;

        let sortable = table
            .columns
            .iter()
            .any(|c| c.name == column && c.sortable && c.kind == ColumnKind::Data);
        let refresh = match last_applied {
            Some(refresh) if sortable => refresh.forced(),
            _ => {
                tracing::debug!(panel = self.shared.index, column, "Rejected sort column");
                return Some(SortOutcome::NotSortable);
            }
        };
        table.sort.cycle(column);
        let sort = table.sort.clone();

        if options.server_side_sorting {
            drop(state);
            tracing::debug!(panel = self.shared.index, ?sort, "Server-side sort");
            self.dispatch(refresh);
            Some(SortOutcome::Refetching(sort))
        } else {
            apply_local_sort(table);
            Some(SortOutcome::Resorted(sort))
        }
    }

    fn dispatch(&self, options: RefreshOptions) {
        let shared = &self.shared;
        let mut state = shared.lock();
        if !state.mounted {
            return;
        }

        if let Some(previous) = state.in_flight.take() {
            tracing::debug!(panel = shared.index, generation = state.generation, "Cancelling in-flight fetch");
            previous.cancel();
        }
        state.generation += 1;
        let generation = state.generation;
        state.last_applied = Some(options.clone());

        let query = match build_query(&shared.panel, &options, state.table.as_ref()) {
            Ok(query) => query,
            Err(error) => {
                tracing::warn!(panel = shared.index, %error, "Panel refresh rejected");
                state.status = PanelStatus::Failed;
                state.error = Some(error);
                drop(state);
                shared.publish(PanelStatus::Failed, generation);
                return;
            }
        };

        let token = self.mount_token.child_token();
        state.in_flight = Some(token.clone());
        state.status = PanelStatus::Loading;
        state.fetches += 1;
        state.loading.on_fetch_started(Instant::now());
        drop(state);
        shared.publish(PanelStatus::Loading, generation);

        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            let outcome = shared.executor.execute(&query, token.clone()).await;
            shared.complete(generation, &token, outcome);
        });
    }
}

impl RefreshablePanel for PanelRuntime {
    fn index(&self) -> usize {
        self.shared.index
    }

    fn refresh(&self, options: &RefreshOptions) {
        {
            let state = self.shared.lock();
            if !options.force_refresh && state.last_applied.as_ref() == Some(options) {
                tracing::trace!(panel = self.shared.index, "Skipping unchanged refresh");
                return;
            }
        }
        self.dispatch(options.clone());
    }

    fn last_refresh_parameters(&self) -> Option<RefreshOptions> {
        self.shared.lock().last_applied.clone()
    }

    fn chart_instance(&self) -> Option<ChartInstanceHandle> {
        if self.is_mounted() { self.chart } else { None }
    }
}

impl Drop for PanelRuntime {
    fn drop(&mut self) {
        self.mount_token.cancel();
    }
}

impl PanelShared {
    fn lock(&self) -> MutexGuard<'_, PanelState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, status: PanelStatus, generation: u64) {
        let _ = self.events.send(PanelEvent {
            panel: self.index,
            status,
            generation,
        });
    }

    fn complete(
        &self,
        generation: u64,
        token: &CancellationToken,
        outcome: Result<QueryResult, QueryError>,
    ) {
        let mut state = self.lock();
        if !state.mounted || token.is_cancelled() || state.generation != generation {
            tracing::debug!(panel = self.index, generation, "Discarding stale fetch result");
            return;
        }
        state.in_flight = None;

        let status = match outcome {
            Ok(result) => {
                tracing::debug!(panel = self.index, generation, rows = result.row_count, "Panel data loaded");
                let result = Arc::new(match self.panel.kind {
                    PanelKind::TransposeTable(_) => table_pipeline::transpose(&result),
                    _ => result,
                });
                if let (Some(table), Some(options)) =
                    (state.table.as_mut(), self.panel.kind.table_options())
                {
                    rebuild_table(table, &result, options);
                }
                state.result = Some(result);
                state.error = None;
                state.loading.on_settled(Instant::now(), true);
                PanelStatus::Ready
            }
            Err(error) if error.is_cancellation() => {
                tracing::debug!(panel = self.index, generation, "Fetch aborted");
                state.loading.on_settled(Instant::now(), false);
                PanelStatus::Idle
            }
            Err(error) => {
                tracing::warn!(panel = self.index, generation, %error, "Panel query failed");
                state.error = Some(PanelError::Query(error));
                state.loading.on_settled(Instant::now(), false);
                PanelStatus::Failed
            }
        };
        state.status = status;
        drop(state);
        self.publish(status, generation);
    }
}

/// Pure transform from the declared query to what is sent for this refresh.
fn build_query(
    panel: &Panel,
    options: &RefreshOptions,
    table: Option<&TableView>,
) -> Result<Query, PanelError> {
    let declared = panel.query.as_ref().ok_or(PanelError::MissingQuery)?;
    if declared.text.trim().is_empty() {
        return Err(PanelError::MissingQuery);
    }

    let mut text = match &options.selected_time_span {
        Some(span) => substitute_time_placeholders(&declared.text, span),
        None => declared.text.clone(),
    };
    if let (Some(table), Some(table_options)) = (table, panel.kind.table_options()) {
        if table_options.server_side_sorting {
            text = table_pipeline::rewrite_order_by(&text, table.sort.active());
        }
    }

    let mut query = declared.with_text(text);
    if let Some(filter) = options.filter_text() {
        query
            .parameters
            .insert(FILTER_PARAMETER.to_string(), filter.to_string());
    }
    Ok(query)
}

/// The first field option naming a result column picks the headline
/// column, otherwise the first column is used.
fn stat_value(options: &StatOptions, result: &QueryResult) -> Option<String> {
    let (column, option) = options
        .field_options
        .iter()
        .find_map(|option| result.column(&option.name).map(|column| (column, Some(option))))
        .or_else(|| result.columns.first().map(|column| (column, None)))?;
    let value = result.first_value(&column.name)?;
    let format = option
        .and_then(|o| o.format.clone())
        .unwrap_or_else(|| table_pipeline::infer_format(&column.data_type, std::iter::once(value)));
    Some(format.format(value))
}

fn rebuild_table(
    table: &mut TableView,
    result: &QueryResult,
    options: &crate::domain::panel::TableOptions,
) {
    table.columns = table_pipeline::build_columns(
        &result.columns,
        &result.rows,
        &options.field_options,
        &options.actions,
    );
    table.rows = result.rows.clone();
    if !options.server_side_sorting {
        apply_local_sort(table);
    }
}

fn apply_local_sort(table: &mut TableView) {
    let Some((name, order)) = table.sort.active() else {
        return;
    };
    if let Some(column) = table.columns.iter().find(|c| c.name == name) {
        table_pipeline::sort_rows(&mut table.rows, column, order);
    }
}
