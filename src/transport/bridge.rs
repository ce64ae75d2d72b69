//! HTTP bridge transport
//!
//! Calls `POST {url}/rest/v1/rpc/{function}` with `{query, read_only}` and
//! expects a JSON array of row objects back. Anything else fails closed as
//! [`TransportError::Malformed`].

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::{Row, SqlTransport, TransportKind};
use crate::error::TransportError;

#[derive(Debug, Clone)]
pub struct RpcBridge {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    function: String,
}

#[derive(Serialize)]
struct RpcPayload<'a> {
    query: &'a str,
    read_only: bool,
}

impl RpcBridge {
    pub fn new(base_url: &str, api_key: &str, function: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            function: function.to_string(),
        }
    }

    fn rpc_url(&self) -> String {
        format!("{}/rest/v1/rpc/{}", self.base_url, self.function)
    }
}

#[async_trait]
impl SqlTransport for RpcBridge {
    fn kind(&self) -> TransportKind {
        TransportKind::Bridge
    }

    async fn execute(&self, sql: &str, read_only: bool) -> Result<Vec<Row>, TransportError> {
        debug!(function = %self.function, read_only, "Calling SQL bridge");

        let response = self
            .client
            .post(self.rpc_url())
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&RpcPayload { query: sql, read_only })
            .send()
            .await
            .map_err(|e| TransportError::Connect(e.without_url().to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = match response.text().await {
                Ok(body) => remote_message(&body),
                Err(e) => format!("unreadable response body: {}", e.without_url()),
            };
            return Err(TransportError::Remote {
                status: status.as_u16(),
                body,
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| TransportError::Malformed(e.without_url().to_string()))?;

        parse_rows(body)
    }
}

/// Validate the RPC result shape: an array of objects, or `null` for
/// statements that produce no rows.
pub fn parse_rows(body: Value) -> Result<Vec<Row>, TransportError> {
    match body {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, item)| match item {
                Value::Object(row) => Ok(row),
                other => Err(TransportError::Malformed(format!(
                    "row {} is {}, expected an object",
                    i,
                    json_type(&other)
                ))),
            })
            .collect(),
        other => Err(TransportError::Malformed(format!(
            "expected an array of rows, got {}",
            json_type(&other)
        ))),
    }
}

/// PostgREST errors are `{"message": ..., "code": ...}`; keep just the message
fn remote_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_rows_array_of_objects() {
        let rows = parse_rows(json!([{"id": 1, "name": "a"}, {"id": 2, "name": "b"}])).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["name"], "b");
    }

    #[test]
    fn test_parse_rows_null_is_empty() {
        assert!(parse_rows(Value::Null).unwrap().is_empty());
    }

    #[test]
    fn test_parse_rows_rejects_scalars() {
        let err = parse_rows(json!("ok")).unwrap_err();
        assert!(matches!(err, TransportError::Malformed(_)));

        let err = parse_rows(json!([1, 2])).unwrap_err();
        assert!(err.to_string().contains("row 0"));
    }

    #[test]
    fn test_remote_message_extracts_postgrest_message() {
        let body = r#"{"code":"42P01","message":"relation \"nope\" does not exist"}"#;
        assert_eq!(remote_message(body), "relation \"nope\" does not exist");
        assert_eq!(remote_message("gateway timeout"), "gateway timeout");
    }

    #[test]
    fn test_rpc_url_trims_slash() {
        let bridge = RpcBridge::new("http://kong:8000/", "key", "execute_sql");
        assert_eq!(bridge.rpc_url(), "http://kong:8000/rest/v1/rpc/execute_sql");
    }
}
