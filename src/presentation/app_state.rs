// Application state for HTTP handlers
use crate::application::catalog::DashboardCatalog;

pub struct AppState {
    pub catalog: DashboardCatalog,
}
