//! Edge function store
//!
//! Versioned deploy/delete over three relations: definitions, files and
//! deployment history. Per function name the state is either absent or
//! active at some version `n`:
//! - first deploy: insert definition at version 1, insert files, append history
//! - redeploy: conditional update to `n + 1`, replace all files, append history
//! - delete: remove the definition; files and history go with it by cascade
//!
//! The version bump and the file replacement are one conditional write on the
//! version that was read. Two racing deploys of one name cannot both land on
//! `n + 1`, and the loser gets [`AdapterError::Conflict`] with none of its
//! files written.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Component, Path};
use std::sync::{Arc, LazyLock};
use tracing::{info, warn};

use crate::error::{AdapterError, Result};
use crate::fs_sync::SyncHandle;

pub mod rest;
pub mod sqlite;

pub use rest::RestFunctionRecords;
pub use sqlite::SqliteFunctionRecords;

pub const DEFAULT_ENTRYPOINT: &str = "index.ts";

static FUNCTION_NAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FunctionStatus {
    Active,
}

impl FunctionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FunctionStatus::Active => "ACTIVE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(FunctionStatus::Active),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    Deployed,
    Failed,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Deployed => "DEPLOYED",
            DeploymentStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DEPLOYED" => Some(DeploymentStatus::Deployed),
            "FAILED" => Some(DeploymentStatus::Failed),
            _ => None,
        }
    }
}

/// Function metadata row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub status: FunctionStatus,
    pub version: i64,
    pub entrypoint_path: String,
    pub import_map_path: Option<String>,
    pub verify_jwt: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One source file; `content` is the full file, never a diff
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionFile {
    pub name: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionWithFiles {
    #[serde(flatten)]
    pub definition: FunctionDefinition,
    pub files: Vec<FunctionFile>,
}

/// Append-only history row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub function_id: String,
    pub version: i64,
    pub status: DeploymentStatus,
    pub deployed_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

/// Deploy request as accepted from the tool layer or `POST /functions`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub files: Vec<FunctionFile>,
    #[serde(default)]
    pub entrypoint_path: Option<String>,
    #[serde(default)]
    pub import_map_path: Option<String>,
    #[serde(default)]
    pub verify_jwt: Option<bool>,
}

/// Persistence for the three function relations
#[async_trait]
pub trait FunctionRecords: Send + Sync {
    async fn find(&self, name: &str) -> Result<Option<FunctionDefinition>>;

    async fn list(&self) -> Result<Vec<FunctionDefinition>>;

    /// Insert a new definition together with its files, atomically.
    /// Fails with `Conflict` if the name is taken.
    async fn create(&self, definition: &FunctionDefinition, files: &[FunctionFile]) -> Result<FunctionDefinition>;

    /// Overwrite the definition and replace all of its files as one unit, only
    /// if the stored version still equals `expected_version`. Fails with
    /// `Conflict` otherwise, leaving definition and files untouched.
    async fn advance(
        &self,
        expected_version: i64,
        definition: &FunctionDefinition,
        files: &[FunctionFile],
    ) -> Result<FunctionDefinition>;

    async fn files(&self, function_id: &str) -> Result<Vec<FunctionFile>>;

    async fn append_deployment(&self, record: &DeploymentRecord) -> Result<()>;

    async fn deployments(&self, function_id: &str) -> Result<Vec<DeploymentRecord>>;

    /// Delete the definition (cascading to files and history). `false` if absent.
    async fn delete(&self, function_id: &str) -> Result<bool>;
}

/// Reject malformed deploys before anything is written
pub fn validate(request: &DeployRequest) -> Result<()> {
    if request.name.trim().is_empty() {
        return Err(AdapterError::Validation("function name is required".to_string()));
    }
    if !FUNCTION_NAME.is_match(&request.name) {
        return Err(AdapterError::Validation(format!(
            "function name '{}' may only contain letters, digits, '-' and '_'",
            request.name
        )));
    }
    if request.files.is_empty() {
        return Err(AdapterError::Validation("at least one file is required".to_string()));
    }

    let mut seen = HashSet::new();
    for file in &request.files {
        let path = normalized_file_name(&file.name)?;
        if !seen.insert(path) {
            return Err(AdapterError::Validation(format!("duplicate file '{}'", file.name)));
        }
    }
    Ok(())
}

/// File names become paths under the function directory, so they must stay
/// inside it. Returns the `/`-joined normal form used for duplicate detection.
fn normalized_file_name(name: &str) -> Result<String> {
    if name.trim().is_empty() {
        return Err(AdapterError::Validation("file name is required".to_string()));
    }

    let mut parts = Vec::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => {
                return Err(AdapterError::Validation(format!(
                    "file name '{}' must be a relative path without '..'",
                    name
                )))
            }
        }
    }

    if parts.is_empty() {
        return Err(AdapterError::Validation(format!("file name '{}' does not name a file", name)));
    }
    Ok(parts.join("/"))
}

pub struct FunctionStore {
    records: Arc<dyn FunctionRecords>,
    sync: SyncHandle,
}

impl FunctionStore {
    pub fn new(records: Arc<dyn FunctionRecords>, sync: SyncHandle) -> Self {
        Self { records, sync }
    }

    pub async fn list(&self) -> Result<Vec<FunctionWithFiles>> {
        let definitions = self.records.list().await?;
        let mut out = Vec::with_capacity(definitions.len());
        for definition in definitions {
            let files = self.records.files(&definition.id).await?;
            out.push(FunctionWithFiles { definition, files });
        }
        Ok(out)
    }

    pub async fn get(&self, name: &str) -> Result<FunctionWithFiles> {
        let definition = self.require(name).await?;
        let files = self.records.files(&definition.id).await?;
        Ok(FunctionWithFiles { definition, files })
    }

    pub async fn deploy(&self, request: DeployRequest) -> Result<FunctionDefinition> {
        validate(&request)?;

        let now = Utc::now();
        let definition = match self.records.find(&request.name).await? {
            None => {
                let fresh = FunctionDefinition {
                    id: uuid::Uuid::new_v4().to_string(),
                    name: request.name.clone(),
                    slug: request.name.clone(),
                    status: FunctionStatus::Active,
                    version: 1,
                    entrypoint_path: request
                        .entrypoint_path
                        .clone()
                        .unwrap_or_else(|| DEFAULT_ENTRYPOINT.to_string()),
                    import_map_path: request.import_map_path.clone(),
                    verify_jwt: request.verify_jwt.unwrap_or(true),
                    created_at: now,
                    updated_at: now,
                };
                self.records.create(&fresh, &request.files).await?
            }
            Some(current) => {
                let next = FunctionDefinition {
                    status: FunctionStatus::Active,
                    version: current.version + 1,
                    entrypoint_path: request
                        .entrypoint_path
                        .clone()
                        .unwrap_or_else(|| DEFAULT_ENTRYPOINT.to_string()),
                    import_map_path: request.import_map_path.clone(),
                    verify_jwt: request.verify_jwt.unwrap_or(true),
                    updated_at: now,
                    ..current.clone()
                };
                self.records.advance(current.version, &next, &request.files).await?
            }
        };

        let history = DeploymentRecord {
            function_id: definition.id.clone(),
            version: definition.version,
            status: DeploymentStatus::Deployed,
            deployed_at: now,
            error_message: None,
        };
        if let Err(e) = self.records.append_deployment(&history).await {
            warn!(function = %definition.name, version = definition.version, error = %e,
                "Failed to record deployment history");
        }

        info!(function = %definition.name, version = definition.version, "Function deployed");
        self.sync.materialize(&definition.name, request.files);

        Ok(definition)
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        let definition = self.require(name).await?;
        if !self.records.delete(&definition.id).await? {
            return Err(not_found(name));
        }

        info!(function = name, version = definition.version, "Function deleted");
        self.sync.remove(name);
        Ok(())
    }

    /// Deployment history in version order
    pub async fn deployments(&self, name: &str) -> Result<Vec<DeploymentRecord>> {
        let definition = self.require(name).await?;
        let mut records = self.records.deployments(&definition.id).await?;
        records.sort_by_key(|r| r.version);
        Ok(records)
    }

    /// Re-materialize the stored files on disk
    pub async fn resync(&self, name: &str) -> Result<()> {
        let function = self.get(name).await?;
        if !self.sync.is_enabled() {
            return Err(AdapterError::unsupported(
                "no functions directory configured, nothing to resync",
            ));
        }
        self.sync.materialize(name, function.files);
        Ok(())
    }

    /// Wait for queued filesystem work to finish
    pub async fn flush_sync(&self) {
        self.sync.flush().await;
    }

    async fn require(&self, name: &str) -> Result<FunctionDefinition> {
        self.records.find(name).await?.ok_or_else(|| not_found(name))
    }
}

fn not_found(name: &str) -> AdapterError {
    AdapterError::NotFound(format!("function '{}'", name))
}
