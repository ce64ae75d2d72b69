//! Direct Postgres transport
//!
//! Holds a single long-lived connection for the adapter's lifetime. The
//! connection is not pooled; an async mutex serializes statements from
//! concurrent operations so they never interleave on the wire.
//!
//! Statements go through the simple-query protocol (`raw_sql`) so arbitrary
//! multi-statement scripts work. Simple-query results always arrive in text
//! format, which is what [`row_to_json`] decodes.
//!
//! Read-only statements run in a `SERIALIZABLE READ ONLY` transaction. They
//! must be a single statement, so a script cannot end that transaction and
//! carry on outside it.

use async_trait::async_trait;
use serde_json::{Number, Value};
use sqlx::postgres::{PgConnection, PgRow};
use sqlx::{Column, Connection, Executor, Row as _, TypeInfo};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Row, SqlTransport, TransportKind};
use crate::error::TransportError;
use crate::migrations::{LedgerStore, MigrationRecord, LEDGER_DDL};

const BEGIN_READ_ONLY: &str = "BEGIN ISOLATION LEVEL SERIALIZABLE READ ONLY";

pub struct DirectConnection {
    conn: Mutex<Option<PgConnection>>,
}

impl DirectConnection {
    /// Connect to Postgres. Fails if the server is unreachable.
    pub async fn open(database_url: &str) -> Result<Self, TransportError> {
        let conn = PgConnection::connect(database_url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        info!("Direct database connection established");
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Close the connection. Later statements fail with [`TransportError::Connect`].
    pub async fn close(&self) {
        if let Some(conn) = self.conn.lock().await.take() {
            if let Err(e) = conn.close().await {
                warn!(error = %e, "Error while closing direct connection");
            }
        }
    }

    pub async fn is_open(&self) -> bool {
        self.conn.lock().await.is_some()
    }
}

fn closed() -> TransportError {
    TransportError::Connect("direct connection is closed".to_string())
}

fn query_err(e: sqlx::Error) -> TransportError {
    TransportError::Query(e.to_string())
}

async fn read_only_statement(conn: &mut PgConnection, sql: &str) -> Result<Vec<PgRow>, sqlx::Error> {
    // Parse rejects multi-statement strings
    (&mut *conn).prepare(sql).await?;
    (&mut *conn).fetch_all(sqlx::raw_sql(sql)).await
}

async fn rollback(conn: &mut PgConnection, what: &str) {
    if let Err(e) = (&mut *conn).execute(sqlx::raw_sql("ROLLBACK")).await {
        warn!(error = %e, "Rollback of {} failed", what);
    }
}

#[async_trait]
impl SqlTransport for DirectConnection {
    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }

    async fn execute(&self, sql: &str, read_only: bool) -> Result<Vec<Row>, TransportError> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(closed)?;

        let rows = if read_only {
            (&mut *conn).execute(sqlx::raw_sql(BEGIN_READ_ONLY))
                .await
                .map_err(query_err)?;
            match read_only_statement(conn, sql).await {
                Ok(rows) => {
                    (&mut *conn).execute(sqlx::raw_sql("COMMIT")).await.map_err(query_err)?;
                    rows
                }
                Err(e) => {
                    rollback(conn, "read-only transaction").await;
                    return Err(query_err(e));
                }
            }
        } else {
            (&mut *conn).fetch_all(sqlx::raw_sql(sql)).await.map_err(query_err)?
        };

        debug!(rows = rows.len(), read_only, "Direct statement complete");
        rows.iter().map(row_to_json).collect()
    }
}

#[async_trait]
impl LedgerStore for DirectConnection {
    async fn applied(&self) -> Result<Vec<MigrationRecord>, TransportError> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(closed)?;

        let present: bool = sqlx::query_scalar::<_, bool>(
            "SELECT to_regclass('supabase_migrations.schema_migrations') IS NOT NULL",
        )
        .fetch_one(&mut *conn)
        .await
        .map_err(query_err)?;

        if !present {
            return Ok(Vec::new());
        }

        let rows = sqlx::query("SELECT version, name FROM supabase_migrations.schema_migrations ORDER BY version")
            .fetch_all(&mut *conn)
            .await
            .map_err(query_err)?;

        rows.iter()
            .map(|row| {
                Ok(MigrationRecord {
                    version: row.try_get("version").map_err(query_err)?,
                    name: row
                        .try_get::<Option<String>, _>("name")
                        .map_err(query_err)?
                        .unwrap_or_default(),
                })
            })
            .collect()
    }

    async fn apply(&self, record: &MigrationRecord, sql: &str) -> Result<bool, TransportError> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(closed)?;

        (&mut *conn).execute(sqlx::raw_sql("BEGIN")).await.map_err(query_err)?;
        match apply_statements(conn, record, sql).await {
            Ok(inserted) => {
                (&mut *conn).execute(sqlx::raw_sql("COMMIT")).await.map_err(query_err)?;
                Ok(inserted)
            }
            Err(e) => {
                rollback(conn, "migration").await;
                Err(query_err(e))
            }
        }
    }
}

/// Migration body and its ledger row; the caller owns the transaction
async fn apply_statements(conn: &mut PgConnection, record: &MigrationRecord, sql: &str) -> Result<bool, sqlx::Error> {
    (&mut *conn).execute(sqlx::raw_sql(LEDGER_DDL)).await?;
    (&mut *conn).execute(sqlx::raw_sql(sql)).await?;

    let result = sqlx::query(
        "INSERT INTO supabase_migrations.schema_migrations (version, name, statements) \
         VALUES ($1, $2, $3) ON CONFLICT (version) DO NOTHING",
    )
    .bind(&record.version)
    .bind(&record.name)
    .bind(vec![sql.to_string()])
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Convert a text-format row into a JSON object
fn row_to_json(row: &PgRow) -> Result<Row, TransportError> {
    let mut out = Row::new();
    for column in row.columns() {
        let raw: Option<String> = row
            .try_get_unchecked(column.ordinal())
            .map_err(|e| TransportError::Malformed(format!("column {}: {}", column.name(), e)))?;
        let value = match raw {
            Some(text) => text_to_json(column.type_info().name(), text),
            None => Value::Null,
        };
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

/// Map a Postgres text value to JSON by its type name. Unknown types stay strings.
fn text_to_json(type_name: &str, text: String) -> Value {
    match type_name {
        "BOOL" => Value::Bool(text == "t"),
        "INT2" | "INT4" | "INT8" | "OID" => text
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or(Value::String(text)),
        "FLOAT4" | "FLOAT8" | "NUMERIC" => text
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::String(text)),
        "JSON" | "JSONB" => serde_json::from_str(&text).unwrap_or(Value::String(text)),
        _ => Value::String(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_text_to_json_scalars() {
        assert_eq!(text_to_json("BOOL", "t".into()), json!(true));
        assert_eq!(text_to_json("BOOL", "f".into()), json!(false));
        assert_eq!(text_to_json("INT8", "42".into()), json!(42));
        assert_eq!(text_to_json("FLOAT8", "1.5".into()), json!(1.5));
        assert_eq!(text_to_json("TEXT", "hello".into()), json!("hello"));
    }

    #[test]
    fn test_text_to_json_nan_stays_string() {
        assert_eq!(text_to_json("NUMERIC", "NaN".into()), json!("NaN"));
    }

    #[test]
    fn test_text_to_json_parses_jsonb() {
        assert_eq!(text_to_json("JSONB", r#"{"a":[1,2]}"#.into()), json!({"a": [1, 2]}));
        assert_eq!(text_to_json("JSON", "not json".into()), json!("not json"));
    }

    #[test]
    fn test_text_to_json_unknown_type() {
        assert_eq!(
            text_to_json("TIMESTAMPTZ", "2024-01-01 00:00:00+00".into()),
            json!("2024-01-01 00:00:00+00")
        );
    }
}
