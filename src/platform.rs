//! Self-hosted platform facade
//!
//! The fixed capability set the tool layer calls. SQL-shaped operations go to
//! the [`DualTransportExecutor`] and [`MigrationLedger`]; function operations
//! go to the [`FunctionStore`]. Capabilities that only exist on the managed
//! platform fail with `UnsupportedOperation` without touching any upstream.

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{Settings, StoreBackend};
use crate::error::{AdapterError, Result};
use crate::executor::DualTransportExecutor;
use crate::fs_sync::{FilesystemSync, SyncHandle};
use crate::functions::{
    DeployRequest, DeploymentRecord, FunctionDefinition, FunctionRecords, FunctionStore, FunctionWithFiles,
    RestFunctionRecords, SqliteFunctionRecords,
};
use crate::migrations::{LedgerStore, MigrationLedger, MigrationRecord};
use crate::transport::{Row, RpcBridge, SqlTransport};

#[cfg(feature = "postgres")]
use crate::transport::DirectConnection;

pub const SELF_HOSTED_ORG_ID: &str = "self-hosted";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: String,
    pub name: String,
}

impl Organization {
    fn placeholder() -> Self {
        Self {
            id: SELF_HOSTED_ORG_ID.to_string(),
            name: "Self-hosted".to_string(),
        }
    }
}

#[async_trait]
pub trait Platform: Send + Sync {
    async fn execute_sql(&self, query: &str, read_only: bool) -> Result<Vec<Row>>;
    async fn list_migrations(&self) -> Result<Vec<MigrationRecord>>;
    async fn apply_migration(&self, name: &str, query: &str) -> Result<MigrationRecord>;

    async fn list_functions(&self) -> Result<Vec<FunctionWithFiles>>;
    async fn get_function(&self, name: &str) -> Result<FunctionWithFiles>;
    async fn deploy_function(&self, request: DeployRequest) -> Result<FunctionDefinition>;
    async fn delete_function(&self, name: &str) -> Result<()>;
    async fn list_function_deployments(&self, name: &str) -> Result<Vec<DeploymentRecord>>;
    async fn resync_function(&self, name: &str) -> Result<()>;

    async fn get_project_url(&self) -> Result<String>;
    async fn get_anon_key(&self) -> Result<String>;
    async fn list_tables(&self, schemas: &[String]) -> Result<Vec<Row>>;
    async fn list_extensions(&self) -> Result<Vec<Row>>;

    async fn list_organizations(&self) -> Result<Vec<Organization>>;
    async fn get_organization(&self, id: &str) -> Result<Organization>;

    async fn list_branches(&self) -> Result<Vec<Row>>;
    async fn create_branch(&self, name: &str) -> Result<Row>;
    async fn delete_branch(&self, branch_id: &str) -> Result<()>;
    async fn get_logs(&self, service: &str) -> Result<Vec<Row>>;
    async fn get_security_advisors(&self) -> Result<Vec<Row>>;
    async fn get_performance_advisors(&self) -> Result<Vec<Row>>;
    async fn deploy_zipped_function(&self, name: &str, archive: &[u8]) -> Result<FunctionDefinition>;
}

/// Values surfaced by the project-info operations
#[derive(Debug, Clone, Default)]
pub struct ProjectInfo {
    pub url: String,
    pub anon_key: Option<String>,
}

pub struct SelfHostedPlatform {
    executor: Arc<DualTransportExecutor>,
    ledger: MigrationLedger,
    functions: Arc<FunctionStore>,
    project: ProjectInfo,
    #[cfg(feature = "postgres")]
    direct: Option<Arc<DirectConnection>>,
    sync_worker: Option<JoinHandle<()>>,
}

impl SelfHostedPlatform {
    /// Assemble a platform from already-built parts
    pub fn new(
        executor: Arc<DualTransportExecutor>,
        ledger: MigrationLedger,
        functions: Arc<FunctionStore>,
        project: ProjectInfo,
    ) -> Self {
        Self {
            executor,
            ledger,
            functions,
            project,
            #[cfg(feature = "postgres")]
            direct: None,
            sync_worker: None,
        }
    }

    /// Build every component from resolved settings.
    ///
    /// A direct connection that cannot be opened is not fatal: the platform
    /// runs bridge-only and the migration ledger goes untracked.
    pub async fn open(settings: &Settings) -> anyhow::Result<Self> {
        let config = &settings.config;

        let bridge: Arc<dyn SqlTransport> = Arc::new(RpcBridge::new(
            &config.url,
            &settings.service_role_key,
            &config.bridge.rpc_function,
        ));

        #[cfg(feature = "postgres")]
        let direct = match &config.database_url {
            Some(url) => match DirectConnection::open(url).await {
                Ok(conn) => Some(Arc::new(conn)),
                Err(e) => {
                    warn!(error = %e, "Direct connection unavailable, using SQL bridge only");
                    None
                }
            },
            None => None,
        };
        #[cfg(not(feature = "postgres"))]
        if config.database_url.is_some() {
            warn!("Built without the postgres feature, ignoring database_url");
        }

        #[cfg(feature = "postgres")]
        let (direct_transport, ledger_store) = match &direct {
            Some(conn) => (
                Some(conn.clone() as Arc<dyn SqlTransport>),
                Some(conn.clone() as Arc<dyn LedgerStore>),
            ),
            None => (None, None),
        };
        #[cfg(not(feature = "postgres"))]
        let (direct_transport, ledger_store): (Option<Arc<dyn SqlTransport>>, Option<Arc<dyn LedgerStore>>) =
            (None, None);

        let executor = Arc::new(DualTransportExecutor::new(direct_transport, bridge));
        let ledger = MigrationLedger::new(executor.clone(), ledger_store);

        let records: Arc<dyn FunctionRecords> = match config.store.backend {
            StoreBackend::Rest => Arc::new(RestFunctionRecords::new(&config.url, &settings.service_role_key)),
            StoreBackend::Sqlite => {
                let path = match &config.store.sqlite_path {
                    Some(path) => path.clone(),
                    None => default_sqlite_path()?,
                };
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create {}", parent.display()))?;
                }
                Arc::new(
                    SqliteFunctionRecords::open(&path)
                        .with_context(|| format!("Failed to open function store at {}", path.display()))?,
                )
            }
        };

        let (sync, sync_worker) = match &config.functions.dir {
            Some(dir) => {
                let (handle, worker) = FilesystemSync::new(dir)
                    .with_reload_url(config.functions.reload_url.clone())
                    .spawn();
                (handle, Some(worker))
            }
            None => {
                debug!("No functions directory configured, skipping materialization");
                (SyncHandle::disabled(), None)
            }
        };

        info!(
            primary = %executor.primary(),
            tracked_migrations = ledger.is_tracked(),
            store = ?config.store.backend,
            "Self-hosted platform ready"
        );

        Ok(Self {
            executor,
            ledger,
            functions: Arc::new(FunctionStore::new(records, sync)),
            project: ProjectInfo {
                url: config.url.clone(),
                anon_key: settings.anon_key.clone(),
            },
            #[cfg(feature = "postgres")]
            direct,
            sync_worker,
        })
    }

    /// Function store shared with the management API
    pub fn functions(&self) -> Arc<FunctionStore> {
        self.functions.clone()
    }

    pub fn executor(&self) -> Arc<DualTransportExecutor> {
        self.executor.clone()
    }

    /// Drain queued filesystem work and release the direct connection
    pub async fn close(self) {
        self.functions.flush_sync().await;

        #[cfg(feature = "postgres")]
        if let Some(conn) = &self.direct {
            conn.close().await;
        }

        // Queue is drained; the API may still hold store clones, so don't wait on the channel closing
        if let Some(worker) = self.sync_worker {
            worker.abort();
        }
    }
}

fn default_sqlite_path() -> anyhow::Result<PathBuf> {
    let base = dirs::data_dir().context("Could not find data directory")?;
    Ok(base.join("supabase-selfhost").join("functions.sqlite"))
}

/// Quote a value as a SQL string literal
fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn tables_query(schemas: &[String]) -> String {
    let schemas: Vec<String> = if schemas.is_empty() {
        vec![quote_literal("public")]
    } else {
        schemas.iter().map(|s| quote_literal(s)).collect()
    };
    format!(
        "SELECT table_schema AS schema, table_name AS name \
         FROM information_schema.tables \
         WHERE table_type = 'BASE TABLE' AND table_schema IN ({}) \
         ORDER BY table_schema, table_name",
        schemas.join(", ")
    )
}

const EXTENSIONS_QUERY: &str = "SELECT name, default_version, installed_version, comment \
     FROM pg_available_extensions ORDER BY name";

fn unsupported(what: &str) -> AdapterError {
    AdapterError::unsupported(format!("{} is not available on a self-hosted instance", what))
}

#[async_trait]
impl Platform for SelfHostedPlatform {
    async fn execute_sql(&self, query: &str, read_only: bool) -> Result<Vec<Row>> {
        self.executor.execute(query, read_only).await
    }

    async fn list_migrations(&self) -> Result<Vec<MigrationRecord>> {
        self.ledger.list().await
    }

    async fn apply_migration(&self, name: &str, query: &str) -> Result<MigrationRecord> {
        self.ledger.record(name, query).await
    }

    async fn list_functions(&self) -> Result<Vec<FunctionWithFiles>> {
        self.functions.list().await
    }

    async fn get_function(&self, name: &str) -> Result<FunctionWithFiles> {
        self.functions.get(name).await
    }

    async fn deploy_function(&self, request: DeployRequest) -> Result<FunctionDefinition> {
        self.functions.deploy(request).await
    }

    async fn delete_function(&self, name: &str) -> Result<()> {
        self.functions.delete(name).await
    }

    async fn list_function_deployments(&self, name: &str) -> Result<Vec<DeploymentRecord>> {
        self.functions.deployments(name).await
    }

    async fn resync_function(&self, name: &str) -> Result<()> {
        self.functions.resync(name).await
    }

    async fn get_project_url(&self) -> Result<String> {
        Ok(self.project.url.clone())
    }

    async fn get_anon_key(&self) -> Result<String> {
        self.project
            .anon_key
            .clone()
            .ok_or_else(|| AdapterError::unsupported("no anon key configured for this instance"))
    }

    async fn list_tables(&self, schemas: &[String]) -> Result<Vec<Row>> {
        self.executor.execute(&tables_query(schemas), true).await
    }

    async fn list_extensions(&self) -> Result<Vec<Row>> {
        self.executor.execute(EXTENSIONS_QUERY, true).await
    }

    async fn list_organizations(&self) -> Result<Vec<Organization>> {
        Ok(vec![Organization::placeholder()])
    }

    async fn get_organization(&self, id: &str) -> Result<Organization> {
        if id == SELF_HOSTED_ORG_ID {
            Ok(Organization::placeholder())
        } else {
            Err(unsupported("organization management"))
        }
    }

    async fn list_branches(&self) -> Result<Vec<Row>> {
        Err(unsupported("branching"))
    }

    async fn create_branch(&self, _name: &str) -> Result<Row> {
        Err(unsupported("branching"))
    }

    async fn delete_branch(&self, _branch_id: &str) -> Result<()> {
        Err(unsupported("branching"))
    }

    async fn get_logs(&self, _service: &str) -> Result<Vec<Row>> {
        Err(unsupported("log retrieval"))
    }

    async fn get_security_advisors(&self) -> Result<Vec<Row>> {
        Err(unsupported("the security advisor"))
    }

    async fn get_performance_advisors(&self) -> Result<Vec<Row>> {
        Err(unsupported("the performance advisor"))
    }

    async fn deploy_zipped_function(&self, _name: &str, _archive: &[u8]) -> Result<FunctionDefinition> {
        Err(AdapterError::unsupported(
            "zipped function upload is not available on a self-hosted instance, deploy the source files instead",
        ))
    }
}
