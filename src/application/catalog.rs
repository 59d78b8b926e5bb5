// Dashboard catalog - Use case for listing and opening dashboards
use crate::application::dashboard_service::DashboardSession;
use crate::application::migration::migrate;
use crate::application::query_executor::QueryExecutor;
use crate::application::refresh_coordinator::Clock;
use crate::domain::dashboard::Dashboard;
use crate::domain::schema::DashboardSchema;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("dashboard '{0}' not found")]
    UnknownDashboard(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSummary {
    pub name: String,
    pub title: String,
    pub version: u32,
    pub panels: usize,
    pub open: bool,
}

/// Known dashboard documents plus the sessions opened from them. At most
/// one session exists per document.
pub struct DashboardCatalog {
    schemas: BTreeMap<String, DashboardSchema>,
    executor: Arc<dyn QueryExecutor>,
    clock: Arc<dyn Clock>,
    sessions: Mutex<HashMap<String, Arc<DashboardSession>>>,
}

impl DashboardCatalog {
    pub fn new(
        schemas: Vec<DashboardSchema>,
        executor: Arc<dyn QueryExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut by_name = BTreeMap::new();
        for schema in schemas {
            if by_name.contains_key(&schema.name) {
                tracing::warn!(dashboard = %schema.name, "Duplicate dashboard name, keeping the first");
                continue;
            }
            by_name.insert(schema.name.clone(), schema);
        }
        Self {
            schemas: by_name,
            executor,
            clock,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn list(&self) -> Vec<DashboardSummary> {
        let sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        self.schemas
            .values()
            .map(|schema| {
                let dashboard = Dashboard::from_schema(migrate(schema));
                DashboardSummary {
                    name: dashboard.name.clone(),
                    title: dashboard.title.clone(),
                    version: schema.version,
                    panels: dashboard.panel_count(),
                    open: sessions.contains_key(&dashboard.name),
                }
            })
            .collect()
    }

    /// Returns the live session, opening it (and firing its initial refresh) on first use.
    pub fn session(&self, name: &str) -> Result<Arc<DashboardSession>, CatalogError> {
        let schema = self
            .schemas
            .get(name)
            .ok_or_else(|| CatalogError::UnknownDashboard(name.to_string()))?;

        let mut sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        let session = sessions
            .entry(name.to_string())
            .or_insert_with(|| DashboardSession::open(schema, self.executor.clone(), self.clock.clone()));
        Ok(session.clone())
    }

    pub fn close(&self, name: &str) -> Result<(), CatalogError> {
        let session = self
            .sessions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(name)
            .ok_or_else(|| CatalogError::UnknownDashboard(name.to_string()))?;
        session.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::query_executor::testing::{FakeExecutor, sample_result};
    use crate::application::refresh_coordinator::SystemClock;
    use std::time::Duration;

    fn schema(name: &str) -> DashboardSchema {
        serde_json::from_value(serde_json::json!({
            "name": name,
            "title": format!("{name} title"),
            "charts": [
                {"type": "stat", "query": {"sql": "SELECT count() FROM system.processes"}},
                {"title": "More", "charts": [{"type": "line", "query": {"sql": "SELECT 1"}}]}
            ]
        }))
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_is_opened_once() {
        let executor = FakeExecutor::new(sample_result());
        let catalog = DashboardCatalog::new(
            vec![schema("b"), schema("a"), schema("a")],
            executor.clone(),
            Arc::new(SystemClock),
        );

        let listed = catalog.list();
        assert_eq!(listed.iter().map(|d| d.name.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(listed[0].panels, 2);
        assert!(!listed[0].open);

        let first = catalog.session("a").unwrap();
        let second = catalog.session("a").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(executor.call_count(), 2);
        assert!(catalog.list()[0].open);

        // Sessions are keyed by document, so they never outnumber the catalog.
        for _ in 0..3 {
            catalog.session("b").unwrap();
        }
        assert_eq!(catalog.sessions.lock().unwrap().len(), 2);

        catalog.close("a").unwrap();
        assert!(!catalog.list()[0].open);
    }

    #[tokio::test]
    async fn test_unknown_dashboard() {
        let catalog = DashboardCatalog::new(vec![], FakeExecutor::new(sample_result()), Arc::new(SystemClock));
        assert_eq!(
            catalog.session("nope").err(),
            Some(CatalogError::UnknownDashboard("nope".to_string()))
        );
        assert!(catalog.close("nope").is_err());
    }
}
