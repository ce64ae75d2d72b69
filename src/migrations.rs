//! Migration ledger
//!
//! Applied migrations are recorded in `supabase_migrations.schema_migrations`,
//! the same table the Supabase CLI uses. Recording needs a Direct connection
//! so the migration and its ledger row commit together. Without one,
//! migrations still run through the executor but are not tracked.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{AdapterError, Result, TransportError};
use crate::executor::DualTransportExecutor;

/// DDL for the ledger table; idempotent
pub const LEDGER_DDL: &str = r#"
CREATE SCHEMA IF NOT EXISTS supabase_migrations;
CREATE TABLE IF NOT EXISTS supabase_migrations.schema_migrations (
    version TEXT PRIMARY KEY,
    statements TEXT[],
    name TEXT
);
"#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub version: String,
    pub name: String,
}

/// Transactional storage for ledger rows
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn applied(&self) -> std::result::Result<Vec<MigrationRecord>, TransportError>;

    /// Run `sql` and insert `record` in one transaction. Returns `false` when
    /// the version was already present (the insert is skipped, not an error).
    async fn apply(&self, record: &MigrationRecord, sql: &str) -> std::result::Result<bool, TransportError>;
}

/// Version token for a migration created at `at`: `YYYYMMDDHHMMSS`.
///
/// Fixed width, so string order matches time order.
pub fn version_token(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d%H%M%S").to_string()
}

pub struct MigrationLedger {
    executor: Arc<DualTransportExecutor>,
    store: Option<Arc<dyn LedgerStore>>,
}

impl MigrationLedger {
    pub fn new(executor: Arc<DualTransportExecutor>, store: Option<Arc<dyn LedgerStore>>) -> Self {
        Self { executor, store }
    }

    pub fn is_tracked(&self) -> bool {
        self.store.is_some()
    }

    /// Applied migrations in ascending version order; empty when untracked
    pub async fn list(&self) -> Result<Vec<MigrationRecord>> {
        let Some(store) = &self.store else {
            debug!("No direct connection, migration ledger unavailable");
            return Ok(Vec::new());
        };

        let mut records = store
            .applied()
            .await
            .map_err(|e| AdapterError::upstream(e.to_string()))?;
        records.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(records)
    }

    /// Apply `sql` and record it under `name`
    pub async fn record(&self, name: &str, sql: &str) -> Result<MigrationRecord> {
        if name.trim().is_empty() {
            return Err(AdapterError::Validation("migration name must not be empty".to_string()));
        }

        let record = MigrationRecord {
            version: version_token(Utc::now()),
            name: name.to_string(),
        };

        match &self.store {
            Some(store) => {
                let inserted = store
                    .apply(&record, sql)
                    .await
                    .map_err(|e| AdapterError::upstream(e.to_string()))?;
                if inserted {
                    info!(version = %record.version, name = %record.name, "Migration applied");
                } else {
                    debug!(version = %record.version, "Migration version already recorded");
                }
            }
            None => {
                warn!(name = %record.name, "No direct connection, applying migration untracked");
                self.executor.execute(sql, false).await?;
            }
        }

        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::tests::ScriptedTransport;
    use crate::transport::TransportKind;
    use chrono::TimeZone;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    /// In-memory ledger with the same conflict rule as the SQL table
    #[derive(Default)]
    struct MemoryLedger {
        rows: Mutex<Vec<MigrationRecord>>,
        executed: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl LedgerStore for MemoryLedger {
        async fn applied(&self) -> std::result::Result<Vec<MigrationRecord>, TransportError> {
            Ok(self.rows.lock().unwrap().clone())
        }

        async fn apply(&self, record: &MigrationRecord, sql: &str) -> std::result::Result<bool, TransportError> {
            if self.fail {
                return Err(TransportError::Query("syntax error".to_string()));
            }
            self.executed.lock().unwrap().push(sql.to_string());
            let mut rows = self.rows.lock().unwrap();
            if rows.iter().any(|r| r.version == record.version) {
                return Ok(false);
            }
            rows.push(record.clone());
            Ok(true)
        }
    }

    fn bridge_only() -> (Arc<ScriptedTransport>, Arc<DualTransportExecutor>) {
        let bridge = ScriptedTransport::ok(TransportKind::Bridge, vec![]);
        let executor = Arc::new(DualTransportExecutor::new(None, bridge.clone()));
        (bridge, executor)
    }

    #[test]
    fn test_version_token_is_fixed_width() {
        let at = Utc.with_ymd_and_hms(2024, 3, 7, 9, 5, 1).unwrap();
        assert_eq!(version_token(at), "20240307090501");
    }

    #[test]
    fn test_version_token_orders_lexically() {
        let earlier = version_token(Utc.with_ymd_and_hms(2024, 9, 30, 23, 59, 59).unwrap());
        let later = version_token(Utc.with_ymd_and_hms(2024, 10, 1, 0, 0, 0).unwrap());
        assert!(earlier < later);
    }

    #[tokio::test]
    async fn test_record_with_ledger() {
        let (bridge, executor) = bridge_only();
        let store = Arc::new(MemoryLedger::default());
        let ledger = MigrationLedger::new(executor, Some(store.clone()));

        let record = ledger.record("create_todos", "create table todos (id int)").await.unwrap();
        assert_eq!(record.version.len(), 14);

        let listed = ledger.list().await.unwrap();
        assert_eq!(listed, vec![record]);
        assert_eq!(store.executed.lock().unwrap().len(), 1);
        // The ledger path never goes through the executor
        assert_eq!(bridge.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_version_collision_is_ignored() {
        let (_, executor) = bridge_only();
        let store = Arc::new(MemoryLedger::default());
        let version = version_token(Utc::now());
        store.rows.lock().unwrap().push(MigrationRecord {
            version: version.clone(),
            name: "earlier".to_string(),
        });
        let ledger = MigrationLedger::new(executor, Some(store.clone()));

        // Same second as the seeded row, or later; either way no error
        let record = ledger.record("later", "select 1").await.unwrap();
        assert!(record.version >= version);
        assert!(!ledger.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_is_sorted() {
        let (_, executor) = bridge_only();
        let store = Arc::new(MemoryLedger::default());
        {
            let mut rows = store.rows.lock().unwrap();
            rows.push(MigrationRecord { version: "20240201000000".into(), name: "b".into() });
            rows.push(MigrationRecord { version: "20240101000000".into(), name: "a".into() });
        }
        let ledger = MigrationLedger::new(executor, Some(store));

        let names: Vec<String> = ledger.list().await.unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_untracked_mode_executes_via_bridge() {
        let (bridge, executor) = bridge_only();
        let ledger = MigrationLedger::new(executor, None);
        assert!(!ledger.is_tracked());

        ledger.record("add_column", "alter table t add column c int").await.unwrap();

        assert_eq!(bridge.calls.load(Ordering::SeqCst), 1);
        assert_eq!(bridge.seen.lock().unwrap()[0].1, false);
        assert!(ledger.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sql_failure_is_upstream() {
        let (_, executor) = bridge_only();
        let store = Arc::new(MemoryLedger {
            fail: true,
            ..Default::default()
        });
        let ledger = MigrationLedger::new(executor, Some(store));

        let err = ledger.record("broken", "create tabel").await.unwrap_err();
        assert_eq!(err.kind(), "upstream_error");
        assert!(ledger.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_name_rejected() {
        let (bridge, executor) = bridge_only();
        let ledger = MigrationLedger::new(executor, None);

        let err = ledger.record("  ", "select 1").await.unwrap_err();
        assert_eq!(err.kind(), "validation_error");
        assert_eq!(bridge.calls.load(Ordering::SeqCst), 0);
    }
}
