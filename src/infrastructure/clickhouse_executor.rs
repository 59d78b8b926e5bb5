// ClickHouse HTTP interface implementation
use crate::application::query_executor::{QueryError, QueryExecutor};
use crate::domain::panel::Query;
use crate::domain::query_result::{ColumnMeta, QueryResult, Row};
use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

static ERROR_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Code:\s*(\d+)").expect("error code pattern"));

const EXCEPTION_CODE_HEADER: &str = "X-ClickHouse-Exception-Code";

#[derive(Debug, Clone)]
pub struct ClickHouseExecutor {
    client: reqwest::Client,
    host: String,
    user: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct JsonFormatResponse {
    #[serde(default)]
    meta: Vec<ColumnMeta>,
    #[serde(default)]
    data: Vec<Row>,
    #[serde(default)]
    rows: Option<usize>,
}

impl ClickHouseExecutor {
    pub fn new(host: String, user: String, password: String, timeout: Option<Duration>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            client: builder.build().context("Failed to build ClickHouse HTTP client")?,
            host: host.trim_end_matches('/').to_string(),
            user,
            password,
        })
    }

    fn build_query_url(&self, query: &Query) -> String {
        let mut url = format!("{}/?default_format=JSON", self.host);
        for (name, value) in &query.parameters {
            url.push_str(&format!(
                "&param_{}={}",
                urlencoding::encode(name),
                urlencoding::encode(value)
            ));
        }
        url
    }

    async fn run(&self, query: &Query) -> Result<QueryResult, QueryError> {
        let mut request = self
            .client
            .post(self.build_query_url(query))
            .header("X-ClickHouse-User", &self.user)
            .header("X-ClickHouse-Key", &self.password)
            .body(query.text.clone());
        for (name, value) in &query.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| QueryError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let header_code = response
                .headers()
                .get(EXCEPTION_CODE_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok());
            let body = response.text().await.unwrap_or_default();
            tracing::debug!(%status, "ClickHouse rejected query");
            return Err(server_error(header_code, &body));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| QueryError::Transport(e.to_string()))?;
        decode_response(&body)
    }
}

/// Build a server error, preferring the code from the response header.
fn server_error(header_code: Option<i32>, body: &str) -> QueryError {
    let code = header_code.or_else(|| {
        ERROR_CODE
            .captures(body)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    });
    QueryError::Server {
        code,
        message: body.trim().to_string(),
    }
}

fn decode_response(body: &[u8]) -> Result<QueryResult, QueryError> {
    // Statements without a result set (DDL, SET) answer with an empty body.
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(QueryResult::default());
    }
    let parsed: JsonFormatResponse =
        serde_json::from_slice(body).map_err(|e| QueryError::Decode(e.to_string()))?;
    let mut result = QueryResult::new(parsed.meta, parsed.data);
    if let Some(rows) = parsed.rows {
        result.row_count = rows;
    }
    Ok(result)
}

#[async_trait]
impl QueryExecutor for ClickHouseExecutor {
    async fn execute(
        &self,
        query: &Query,
        cancel: CancellationToken,
    ) -> Result<QueryResult, QueryError> {
        tracing::debug!(query = %query.text, parameters = query.parameters.len(), "Executing ClickHouse query");
        // Dropping the request future aborts the HTTP call.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(QueryError::Cancelled),
            result = self.run(query) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn executor() -> ClickHouseExecutor {
        ClickHouseExecutor::new(
            "http://localhost:8123/".to_string(),
            "default".to_string(),
            String::new(),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_build_query_url_encodes_parameters() {
        let mut query = Query::new("SELECT {filter:String}");
        query.parameters = BTreeMap::from([
            ("filter".to_string(), "user = 'a b'".to_string()),
            ("query_id".to_string(), "x&y".to_string()),
        ]);
        assert_eq!(
            executor().build_query_url(&query),
            "http://localhost:8123/?default_format=JSON&param_filter=user%20%3D%20%27a%20b%27&param_query_id=x%26y"
        );
    }

    #[test]
    fn test_decode_json_format() {
        let body = br#"{
            "meta": [{"name": "query_id", "type": "String"}, {"name": "read_rows", "type": "UInt64"}],
            "data": [{"query_id": "a", "read_rows": "1000"}],
            "rows": 1,
            "statistics": {"elapsed": 0.001, "rows_read": 1, "bytes_read": 10}
        }"#;
        let result = decode_response(body).unwrap();
        assert_eq!(result.columns[1], ColumnMeta::new("read_rows", "UInt64"));
        assert_eq!(result.rows[0]["read_rows"], "1000");
        assert_eq!(result.row_count, 1);
    }

    #[test]
    fn test_decode_empty_and_garbage() {
        assert_eq!(decode_response(b"\n").unwrap(), QueryResult::default());
        assert!(matches!(decode_response(b"<html>"), Err(QueryError::Decode(_))));
    }

    #[test]
    fn test_server_error_code() {
        let body = "Code: 60. DB::Exception: Table default.nope does not exist. (UNKNOWN_TABLE)\n";
        assert_eq!(
            server_error(None, body),
            QueryError::Server {
                code: Some(60),
                message: body.trim().to_string(),
            }
        );
        assert!(matches!(server_error(Some(81), body), QueryError::Server { code: Some(81), .. }));
        assert!(matches!(server_error(None, "boom"), QueryError::Server { code: None, .. }));
    }

    #[tokio::test]
    async fn test_cancelled_before_send() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = executor().execute(&Query::new("SELECT 1"), cancel).await;
        assert_eq!(result, Err(QueryError::Cancelled));
    }
}
