// Domain layer - Core business models
pub mod dashboard;
pub mod format;
pub mod panel;
pub mod query_result;
pub mod refresh;
pub mod schema;
pub mod time_span;
