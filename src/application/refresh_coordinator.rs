// Refresh coordinator - fans one refresh generation out to every mounted panel
use crate::application::chart_linking::ChartInstanceHandle;
use crate::domain::refresh::{InputFilter, RefreshOptions, RefreshToken};
use crate::domain::time_span::{TimeSpanSelection, default_time_span};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Delay before a filter change triggers a refresh.
pub const FILTER_DEBOUNCE: Duration = Duration::from_millis(50);

/// Source of the current time for refreshes that fire later.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

impl<F> Clock for F
where
    F: Fn() -> DateTime<Utc> + Send + Sync,
{
    fn now(&self) -> DateTime<Utc> {
        self()
    }
}

/// Capability every mounted panel exposes to its container.
pub trait RefreshablePanel: Send + Sync {
    fn index(&self) -> usize;

    /// Fire-and-forget; the panel owns its loading and error state.
    fn refresh(&self, options: &RefreshOptions);

    fn last_refresh_parameters(&self) -> Option<RefreshOptions>;

    fn chart_instance(&self) -> Option<ChartInstanceHandle> {
        None
    }
}

#[derive(Default)]
struct CoordinatorState {
    panels: BTreeMap<usize, Arc<dyn RefreshablePanel>>,
    /// Span pushed in by the embedding page, if any.
    external_span: Option<TimeSpanSelection>,
    /// Span currently chosen in the selector; None until it initialises.
    selected_span: Option<TimeSpanSelection>,
    filter_text: Option<String>,
    sequence: u64,
}

#[derive(Default)]
pub struct RefreshCoordinator {
    state: Mutex<CoordinatorState>,
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, panel: Arc<dyn RefreshablePanel>) {
        let index = panel.index();
        if self.lock().panels.insert(index, panel).is_some() {
            tracing::warn!(panel = index, "Replaced an already registered panel");
        }
    }

    pub fn deregister(&self, index: usize) -> Option<Arc<dyn RefreshablePanel>> {
        self.lock().panels.remove(&index)
    }

    #[cfg(test)]
    pub fn registered(&self) -> Vec<usize> {
        self.lock().panels.keys().copied().collect()
    }

    pub fn set_external_span(&self, span: Option<TimeSpanSelection>) {
        self.lock().external_span = span;
    }

    pub fn select_span(&self, span: TimeSpanSelection) {
        self.lock().selected_span = Some(span);
    }

    pub fn selected_span(&self) -> Option<TimeSpanSelection> {
        self.lock().selected_span.clone()
    }

    pub fn set_filter_text(&self, text: Option<String>) {
        self.lock().filter_text = text.filter(|t| !t.trim().is_empty());
    }

    /// Live chart engine instances of registered panels.
    pub fn chart_instances(&self) -> Vec<ChartInstanceHandle> {
        let panels: Vec<_> = self.lock().panels.values().cloned().collect();
        panels.iter().filter_map(|p| p.chart_instance()).collect()
    }

    /// Resolve one span for this generation and dispatch it to every live
    /// panel. Returns immediately; panels load on their own.
    pub fn refresh_all(
        &self,
        override_span: Option<TimeSpanSelection>,
        now: DateTime<Utc>,
    ) -> RefreshOptions {
        let (options, panels) = {
            let mut state = self.lock();
            let selection = override_span
                .or_else(|| state.external_span.clone())
                .or_else(|| state.selected_span.clone())
                .unwrap_or_else(|| TimeSpanSelection::Relative(default_time_span()));

            state.sequence += 1;
            let options = RefreshOptions::new(
                selection.resolve(now),
                InputFilter {
                    token: RefreshToken {
                        issued_at_millis: now.timestamp_millis(),
                        sequence: state.sequence,
                    },
                    text: state.filter_text.clone(),
                },
            );
            let panels: Vec<_> = state.panels.values().cloned().collect();
            (options, panels)
        };

        tracing::debug!(
            panels = panels.len(),
            sequence = options.input_filter.as_ref().map(|f| f.token.sequence),
            "Refreshing all panels"
        );
        for panel in &panels {
            panel.refresh(&options);
        }
        options
    }
}

/// Trailing-edge debounce for filter input: each change re-arms the timer
/// and only the last one triggers a refresh.
pub struct FilterDebouncer {
    coordinator: Arc<RefreshCoordinator>,
    clock: Arc<dyn Clock>,
    delay: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl FilterDebouncer {
    pub fn new(coordinator: Arc<RefreshCoordinator>, clock: Arc<dyn Clock>, delay: Duration) -> Self {
        Self {
            coordinator,
            clock,
            delay,
            pending: Mutex::new(None),
        }
    }

    pub fn schedule(&self, text: Option<String>) {
        let coordinator = Arc::clone(&self.coordinator);
        let clock = Arc::clone(&self.clock);
        let delay = self.delay;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            coordinator.set_filter_text(text);
            coordinator.refresh_all(None, clock.now());
        });

        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = pending.replace(task) {
            previous.abort();
        }
    }

    pub fn cancel(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = pending.take() {
            previous.abort();
        }
    }
}

impl Drop for FilterDebouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::panel_runtime::PanelRuntime;
    use crate::application::query_executor::testing::{FakeExecutor, sample_result};
    use crate::domain::panel::Panel;
    use crate::domain::schema::PanelSchema;
    use crate::domain::time_span::{TimeSpan, find_builtin};
    use chrono::Duration as ChronoDuration;
    use tokio::sync::broadcast;

    #[derive(Default)]
    struct Recorder {
        index: usize,
        seen: Mutex<Vec<RefreshOptions>>,
    }

    impl RefreshablePanel for Recorder {
        fn index(&self) -> usize {
            self.index
        }

        fn refresh(&self, options: &RefreshOptions) {
            self.seen.lock().unwrap().push(options.clone());
        }

        fn last_refresh_parameters(&self) -> Option<RefreshOptions> {
            self.seen.lock().unwrap().last().cloned()
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn recorders(n: usize, coordinator: &RefreshCoordinator) -> Vec<Arc<Recorder>> {
        (0..n)
            .map(|index| {
                let recorder = Arc::new(Recorder {
                    index,
                    ..Default::default()
                });
                coordinator.register(recorder.clone());
                recorder
            })
            .collect()
    }

    #[test]
    fn test_all_panels_share_one_resolution() {
        let coordinator = RefreshCoordinator::new();
        let panels = recorders(3, &coordinator);

        let options = coordinator.refresh_all(None, now());
        for panel in &panels {
            assert_eq!(panel.last_refresh_parameters(), Some(options.clone()));
        }
        // Default span applies before the selector is ready.
        let span = options.selected_time_span.unwrap();
        assert_eq!(span.duration(), ChronoDuration::minutes(30));
        assert_eq!(span.end, now());
    }

    #[test]
    fn test_span_precedence() {
        let coordinator = RefreshCoordinator::new();
        let panels = recorders(1, &coordinator);

        coordinator.select_span(TimeSpanSelection::Relative(find_builtin("Last 1 Hour").unwrap()));
        let options = coordinator.refresh_all(None, now());
        assert_eq!(options.selected_time_span.unwrap().duration(), ChronoDuration::hours(1));

        let external = TimeSpan::new(now() - ChronoDuration::days(2), now() - ChronoDuration::days(1));
        coordinator.set_external_span(Some(TimeSpanSelection::Absolute(external)));
        let options = coordinator.refresh_all(None, now());
        assert_eq!(options.selected_time_span, Some(external));

        let override_span = TimeSpanSelection::Relative(find_builtin("Last 5 Mins").unwrap());
        let options = coordinator.refresh_all(Some(override_span), now());
        assert_eq!(options.selected_time_span.unwrap().duration(), ChronoDuration::minutes(5));
        assert_eq!(panels[0].seen.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_repeated_refresh_is_distinct() {
        let coordinator = RefreshCoordinator::new();
        recorders(1, &coordinator);
        let first = coordinator.refresh_all(None, now());
        let second = coordinator.refresh_all(None, now());
        assert_eq!(first.selected_time_span, second.selected_time_span);
        assert_ne!(first, second);
    }

    #[test]
    fn test_deregistered_panels_are_skipped() {
        let coordinator = RefreshCoordinator::new();
        let panels = recorders(2, &coordinator);
        assert!(coordinator.deregister(1).is_some());
        coordinator.refresh_all(None, now());
        assert_eq!(panels[0].seen.lock().unwrap().len(), 1);
        assert!(panels[1].seen.lock().unwrap().is_empty());
        assert_eq!(coordinator.registered(), vec![0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_filter_changes_are_debounced() {
        let coordinator = Arc::new(RefreshCoordinator::new());
        let panels = recorders(2, &coordinator);
        let debouncer = FilterDebouncer::new(coordinator.clone(), Arc::new(now), FILTER_DEBOUNCE);

        for text in ["e", "el", "ela"] {
            debouncer.schedule(Some(text.to_string()));
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(panels[0].seen.lock().unwrap().is_empty());

        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        for panel in &panels {
            let seen = panel.seen.lock().unwrap();
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].filter_text(), Some("ela"));
            // Resolved against the injected clock, not the wall clock.
            assert_eq!(seen[0].selected_time_span.unwrap().end, now());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_refresh_reaches_executor_every_time() {
        let executor = FakeExecutor::holding(sample_result());
        let coordinator = RefreshCoordinator::new();
        let (events, _) = broadcast::channel(16);
        let schema: PanelSchema =
            serde_json::from_value(serde_json::json!({"type": "bar", "query": {"sql": "SELECT 1"}})).unwrap();
        let panel = Arc::new(PanelRuntime::mount(
            0,
            Arc::new(Panel::from_schema(schema)),
            executor.clone(),
            events,
        ));
        coordinator.register(panel.clone());
        assert_eq!(coordinator.chart_instances().len(), 1);

        for _ in 0..4 {
            coordinator.refresh_all(None, now());
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        assert_eq!(executor.call_count(), 4);
        assert_eq!(executor.cancelled_count(), 3);
    }
}
