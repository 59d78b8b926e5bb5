// Port for the query execution service
use crate::domain::panel::Query;
use crate::domain::query_result::QueryResult;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QueryError {
    /// Aborted by the caller; never shown to users.
    #[error("query cancelled")]
    Cancelled,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("server error{}: {message}", code.map(|c| format!(" (code {})", c)).unwrap_or_default())]
    Server { code: Option<i32>, message: String },
    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl QueryError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, QueryError::Cancelled)
    }
}

#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Execute a fully substituted query. Implementations must return
    /// promptly with [`QueryError::Cancelled`] once `cancel` fires.
    async fn execute(
        &self,
        query: &Query,
        cancel: CancellationToken,
    ) -> Result<QueryResult, QueryError>;
}

#[cfg(test)]
pub mod testing {
    //! Recording executor shared by the application tests.
    use super::*;
    use crate::domain::query_result::{ColumnMeta, Row};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use tokio::sync::Notify;

    #[derive(Default)]
    struct Inner {
        calls: Vec<Query>,
        cancelled: usize,
        completed: usize,
        scripted: VecDeque<Result<QueryResult, QueryError>>,
    }

    /// Answers with scripted results (or `default_result`), optionally
    /// holding every call until [`FakeExecutor::release`].
    pub struct FakeExecutor {
        inner: Mutex<Inner>,
        hold: bool,
        gate: Notify,
        default_result: QueryResult,
    }

    impl FakeExecutor {
        pub fn new(default_result: QueryResult) -> Arc<Self> {
            Arc::new(Self {
                inner: Mutex::new(Inner::default()),
                hold: false,
                gate: Notify::new(),
                default_result,
            })
        }

        pub fn holding(default_result: QueryResult) -> Arc<Self> {
            Arc::new(Self {
                inner: Mutex::new(Inner::default()),
                hold: true,
                gate: Notify::new(),
                default_result,
            })
        }

        pub fn push_result(&self, result: Result<QueryResult, QueryError>) {
            self.inner.lock().unwrap().scripted.push_back(result);
        }

        pub fn release(&self) {
            self.gate.notify_waiters();
        }

        pub fn calls(&self) -> Vec<Query> {
            self.inner.lock().unwrap().calls.clone()
        }

        pub fn call_count(&self) -> usize {
            self.inner.lock().unwrap().calls.len()
        }

        pub fn cancelled_count(&self) -> usize {
            self.inner.lock().unwrap().cancelled
        }

        pub fn completed_count(&self) -> usize {
            self.inner.lock().unwrap().completed
        }
    }

    #[async_trait]
    impl QueryExecutor for FakeExecutor {
        async fn execute(
            &self,
            query: &Query,
            cancel: CancellationToken,
        ) -> Result<QueryResult, QueryError> {
            self.inner.lock().unwrap().calls.push(query.clone());

            if self.hold {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        self.inner.lock().unwrap().cancelled += 1;
                        return Err(QueryError::Cancelled);
                    }
                    _ = self.gate.notified() => {}
                }
            } else if cancel.is_cancelled() {
                self.inner.lock().unwrap().cancelled += 1;
                return Err(QueryError::Cancelled);
            }

            let mut inner = self.inner.lock().unwrap();
            inner.completed += 1;
            inner
                .scripted
                .pop_front()
                .unwrap_or_else(|| Ok(self.default_result.clone()))
        }
    }

    pub fn sample_result() -> QueryResult {
        let rows: Vec<Row> = vec![
            serde_json::json!({"query_id": "a", "elapsed": 12.5, "user": "default"}),
            serde_json::json!({"query_id": "b", "elapsed": 3.0, "user": "admin"}),
        ]
        .into_iter()
        .filter_map(|v| v.as_object().cloned())
        .collect();
        QueryResult::new(
            vec![
                ColumnMeta::new("query_id", "String"),
                ColumnMeta::new("elapsed", "Float64"),
                ColumnMeta::new("user", "String"),
            ],
            rows,
        )
    }
}
