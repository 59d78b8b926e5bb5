// Application layer - Dashboard use cases and panel orchestration
pub mod catalog;
pub mod chart_linking;
pub mod dashboard_service;
pub mod layout;
pub mod migration;
pub mod panel_runtime;
pub mod query_executor;
pub mod query_template;
pub mod refresh_coordinator;
pub mod table_pipeline;
