//! Embedded SQLite backend for function records
//!
//! Used for single-node installs and tests. Mirrors the Postgres schema:
//! unique name/slug, files and history cascade with their definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::{
    DeploymentRecord, DeploymentStatus, FunctionDefinition, FunctionFile, FunctionRecords, FunctionStatus,
};
use crate::error::{AdapterError, Result};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS edge_functions (
    id TEXT PRIMARY KEY,
    name TEXT UNIQUE NOT NULL,
    slug TEXT UNIQUE NOT NULL,
    status TEXT NOT NULL DEFAULT 'ACTIVE',
    version INTEGER NOT NULL DEFAULT 1,
    entrypoint_path TEXT NOT NULL,
    import_map_path TEXT,
    verify_jwt INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS edge_function_files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    function_id TEXT NOT NULL,
    name TEXT NOT NULL,
    content TEXT NOT NULL,
    UNIQUE(function_id, name),
    FOREIGN KEY (function_id) REFERENCES edge_functions(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS edge_function_deployments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    function_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    status TEXT NOT NULL,
    deployed_at TEXT NOT NULL,
    error_message TEXT,
    FOREIGN KEY (function_id) REFERENCES edge_functions(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_function_files_function ON edge_function_files(function_id);
CREATE INDEX IF NOT EXISTS idx_function_deployments_function ON edge_function_deployments(function_id);
"#;

const DEFINITION_COLUMNS: &str =
    "id, name, slug, status, version, entrypoint_path, import_map_path, verify_jwt, created_at, updated_at";

pub struct SqliteFunctionRecords {
    conn: Mutex<Connection>,
}

impl SqliteFunctionRecords {
    /// Open or create the store at `db_path`
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AdapterError::upstream(format!("cannot create {:?}: {}", parent, e)))?;
        }
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        // Cascades are off by default in SQLite
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        debug!("Function record tables ready");
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AdapterError::upstream("function store connection poisoned"))
    }
}

fn parse_time(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn bad_enum(idx: usize, raw: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, format!("unknown status '{}'", raw).into())
}

fn row_to_definition(row: &rusqlite::Row) -> rusqlite::Result<FunctionDefinition> {
    let status: String = row.get(3)?;
    Ok(FunctionDefinition {
        id: row.get(0)?,
        name: row.get(1)?,
        slug: row.get(2)?,
        status: FunctionStatus::parse(&status).ok_or_else(|| bad_enum(3, &status))?,
        version: row.get(4)?,
        entrypoint_path: row.get(5)?,
        import_map_path: row.get(6)?,
        verify_jwt: row.get(7)?,
        created_at: parse_time(8, row.get(8)?)?,
        updated_at: parse_time(9, row.get(9)?)?,
    })
}

fn insert_files(tx: &Transaction<'_>, function_id: &str, files: &[FunctionFile]) -> rusqlite::Result<()> {
    let mut stmt = tx.prepare("INSERT INTO edge_function_files (function_id, name, content) VALUES (?1, ?2, ?3)")?;
    for file in files {
        stmt.execute(params![function_id, file.name, file.content])?;
    }
    Ok(())
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation)
}

#[async_trait]
impl FunctionRecords for SqliteFunctionRecords {
    async fn find(&self, name: &str) -> Result<Option<FunctionDefinition>> {
        let conn = self.conn()?;
        let definition = conn
            .query_row(
                &format!("SELECT {} FROM edge_functions WHERE name = ?1", DEFINITION_COLUMNS),
                params![name],
                row_to_definition,
            )
            .optional()?;
        Ok(definition)
    }

    async fn list(&self) -> Result<Vec<FunctionDefinition>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM edge_functions ORDER BY name", DEFINITION_COLUMNS))?;
        let definitions = stmt
            .query_map([], row_to_definition)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(definitions)
    }

    async fn create(&self, definition: &FunctionDefinition, files: &[FunctionFile]) -> Result<FunctionDefinition> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let result = tx.execute(
            &format!(
                "INSERT INTO edge_functions ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                DEFINITION_COLUMNS
            ),
            params![
                definition.id,
                definition.name,
                definition.slug,
                definition.status.as_str(),
                definition.version,
                definition.entrypoint_path,
                definition.import_map_path,
                definition.verify_jwt,
                definition.created_at.to_rfc3339(),
                definition.updated_at.to_rfc3339(),
            ],
        );

        match result {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => {
                return Err(AdapterError::Conflict(format!(
                    "function '{}' already exists",
                    definition.name
                )))
            }
            Err(e) => return Err(e.into()),
        }

        insert_files(&tx, &definition.id, files)?;
        tx.commit()?;
        Ok(definition.clone())
    }

    async fn advance(
        &self,
        expected_version: i64,
        definition: &FunctionDefinition,
        files: &[FunctionFile],
    ) -> Result<FunctionDefinition> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            r#"
            UPDATE edge_functions SET
                status = ?1,
                version = ?2,
                entrypoint_path = ?3,
                import_map_path = ?4,
                verify_jwt = ?5,
                updated_at = ?6
            WHERE id = ?7 AND version = ?8
            "#,
            params![
                definition.status.as_str(),
                definition.version,
                definition.entrypoint_path,
                definition.import_map_path,
                definition.verify_jwt,
                definition.updated_at.to_rfc3339(),
                definition.id,
                expected_version,
            ],
        )?;

        // Dropping the transaction rolls back
        if changed == 0 {
            return Err(AdapterError::Conflict(format!(
                "function '{}' changed since version {} was read",
                definition.name, expected_version
            )));
        }

        tx.execute("DELETE FROM edge_function_files WHERE function_id = ?1", params![definition.id])?;
        insert_files(&tx, &definition.id, files)?;
        tx.commit()?;
        Ok(definition.clone())
    }

    async fn files(&self, function_id: &str) -> Result<Vec<FunctionFile>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT name, content FROM edge_function_files WHERE function_id = ?1 ORDER BY name")?;
        let files = stmt
            .query_map(params![function_id], |row| {
                Ok(FunctionFile {
                    name: row.get(0)?,
                    content: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(files)
    }

    async fn append_deployment(&self, record: &DeploymentRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO edge_function_deployments (function_id, version, status, deployed_at, error_message)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                record.function_id,
                record.version,
                record.status.as_str(),
                record.deployed_at.to_rfc3339(),
                record.error_message,
            ],
        )?;
        Ok(())
    }

    async fn deployments(&self, function_id: &str) -> Result<Vec<DeploymentRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT function_id, version, status, deployed_at, error_message
            FROM edge_function_deployments
            WHERE function_id = ?1
            ORDER BY version, id
            "#,
        )?;
        let records = stmt
            .query_map(params![function_id], |row| {
                let status: String = row.get(2)?;
                Ok(DeploymentRecord {
                    function_id: row.get(0)?,
                    version: row.get(1)?,
                    status: DeploymentStatus::parse(&status).ok_or_else(|| bad_enum(2, &status))?,
                    deployed_at: parse_time(3, row.get(3)?)?,
                    error_message: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    async fn delete(&self, function_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM edge_functions WHERE id = ?1", params![function_id])?;
        Ok(deleted > 0)
    }
}
