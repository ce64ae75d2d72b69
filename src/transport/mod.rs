//! SQL transports
//!
//! Two interchangeable ways to run a statement against the self-hosted
//! database:
//! - [`DirectConnection`]: a native Postgres connection with real
//!   transaction control
//! - [`RpcBridge`]: an HTTP call to a SQL-executing remote procedure exposed
//!   through PostgREST
//!
//! Both return rows as JSON objects so callers never see which one ran.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::fmt;

use crate::error::TransportError;

pub mod bridge;
#[cfg(feature = "postgres")]
pub mod direct;

pub use bridge::RpcBridge;
#[cfg(feature = "postgres")]
pub use direct::DirectConnection;

/// One result row, keyed by column name
pub type Row = Map<String, Value>;

/// Which transport served (or failed) a statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Direct,
    Bridge,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Direct => write!(f, "direct"),
            TransportKind::Bridge => write!(f, "bridge"),
        }
    }
}

#[async_trait]
pub trait SqlTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Run `sql` and return its rows. With `read_only`, the transport must
    /// guarantee the statement cannot persist writes.
    async fn execute(&self, sql: &str, read_only: bool) -> Result<Vec<Row>, TransportError>;
}
