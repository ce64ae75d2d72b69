//! PostgREST backend for function records
//!
//! Talks to the self-hosted instance's `/rest/v1/` endpoint with the service
//! role key. Every response is deserialized into typed rows; anything that
//! doesn't parse fails closed as an upstream error.
//!
//! Creating and advancing a function go through the `deploy_edge_function`
//! procedure so the definition and its files change in one database
//! transaction. A stale version comes back as 409 and maps to `Conflict`.

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::{DeploymentRecord, FunctionDefinition, FunctionFile, FunctionRecords};
use crate::error::{AdapterError, Result};

const FUNCTIONS_TABLE: &str = "edge_functions";
const FILES_TABLE: &str = "edge_function_files";
const DEPLOYMENTS_TABLE: &str = "edge_function_deployments";
const DEPLOY_RPC: &str = "rpc/deploy_edge_function";

#[derive(Debug, Clone)]
pub struct RestFunctionRecords {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Serialize)]
struct DeployCall<'a> {
    definition: &'a FunctionDefinition,
    /// `None` creates; otherwise the version the caller read
    expected_version: Option<i64>,
    files: &'a [FunctionFile],
}

impl RestFunctionRecords {
    pub fn new(base_url: &str, service_role_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: service_role_key.to_string(),
        }
    }

    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
    }

    fn get(&self, table: &str) -> RequestBuilder {
        self.authed(self.client.get(self.rest_url(table)))
    }

    fn post(&self, table: &str) -> RequestBuilder {
        self.authed(self.client.post(self.rest_url(table)))
            .header("Content-Type", "application/json")
    }

    fn delete_from(&self, table: &str) -> RequestBuilder {
        self.authed(self.client.delete(self.rest_url(table)))
    }

    async fn deploy_rpc(
        &self,
        definition: &FunctionDefinition,
        expected_version: Option<i64>,
        files: &[FunctionFile],
    ) -> Result<FunctionDefinition> {
        let call = DeployCall {
            definition,
            expected_version,
            files,
        };
        let response = self.post(DEPLOY_RPC).json(&call).send().await?;
        let mut saved: Vec<FunctionDefinition> = rows(response, "deploy function").await?;
        debug!(function = %definition.name, version = definition.version, files = files.len(), "Function written");
        saved
            .pop()
            .ok_or_else(|| AdapterError::upstream("deploy function: no row returned"))
    }
}

/// Turn a non-2xx response into an error, mapping 409 to `Conflict`
async fn check(response: Response, action: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|e| format!("unreadable response body: {}", e.without_url()));
    if status == StatusCode::CONFLICT {
        return Err(AdapterError::Conflict(format!("{}: {}", action, body)));
    }
    Err(AdapterError::upstream(format!("{} failed: {} - {}", action, status, body)))
}

async fn rows<T: DeserializeOwned>(response: Response, action: &str) -> Result<Vec<T>> {
    let response = check(response, action).await?;
    let text = response.text().await?;
    serde_json::from_str(&text)
        .map_err(|e| AdapterError::upstream(format!("{}: malformed response: {}", action, e)))
}

#[async_trait]
impl FunctionRecords for RestFunctionRecords {
    async fn find(&self, name: &str) -> Result<Option<FunctionDefinition>> {
        let response = self
            .get(FUNCTIONS_TABLE)
            .query(&[("select", "*".to_string()), ("name", format!("eq.{}", name))])
            .send()
            .await?;
        let mut found: Vec<FunctionDefinition> = rows(response, "find function").await?;
        Ok(found.pop())
    }

    async fn list(&self) -> Result<Vec<FunctionDefinition>> {
        let response = self
            .get(FUNCTIONS_TABLE)
            .query(&[("select", "*"), ("order", "name.asc")])
            .send()
            .await?;
        rows(response, "list functions").await
    }

    async fn create(&self, definition: &FunctionDefinition, files: &[FunctionFile]) -> Result<FunctionDefinition> {
        self.deploy_rpc(definition, None, files).await
    }

    async fn advance(
        &self,
        expected_version: i64,
        definition: &FunctionDefinition,
        files: &[FunctionFile],
    ) -> Result<FunctionDefinition> {
        self.deploy_rpc(definition, Some(expected_version), files).await
    }

    async fn files(&self, function_id: &str) -> Result<Vec<FunctionFile>> {
        let response = self
            .get(FILES_TABLE)
            .query(&[
                ("select", "name,content".to_string()),
                ("function_id", format!("eq.{}", function_id)),
                ("order", "name.asc".to_string()),
            ])
            .send()
            .await?;
        rows(response, "list function files").await
    }

    async fn append_deployment(&self, record: &DeploymentRecord) -> Result<()> {
        let response = self
            .post(DEPLOYMENTS_TABLE)
            .header("Prefer", "return=minimal")
            .json(record)
            .send()
            .await?;
        check(response, "record deployment").await?;
        Ok(())
    }

    async fn deployments(&self, function_id: &str) -> Result<Vec<DeploymentRecord>> {
        let response = self
            .get(DEPLOYMENTS_TABLE)
            .query(&[
                ("select", "function_id,version,status,deployed_at,error_message".to_string()),
                ("function_id", format!("eq.{}", function_id)),
                ("order", "version.asc".to_string()),
            ])
            .send()
            .await?;
        rows(response, "list deployments").await
    }

    async fn delete(&self, function_id: &str) -> Result<bool> {
        let response = self
            .delete_from(FUNCTIONS_TABLE)
            .query(&[("id", format!("eq.{}", function_id))])
            .header("Prefer", "return=representation")
            .send()
            .await?;
        let deleted: Vec<serde_json::Value> = rows(response, "delete function").await?;
        Ok(!deleted.is_empty())
    }
}
