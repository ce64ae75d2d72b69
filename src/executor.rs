//! Transport selection and fallback
//!
//! The executor holds an ordered list of transports: Direct first when one was
//! configured and reachable, then the Bridge. Each call walks the list once;
//! the first success wins and earlier failures are logged, not surfaced.
//! There is no retry loop and no circuit breaker, so every call restarts the
//! same chain.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{AdapterError, Result, TransportError};
use crate::transport::{Row, SqlTransport, TransportKind};

/// A transport attempt that failed and was superseded (or surfaced, if last)
#[derive(Debug)]
pub struct AttemptFailure {
    pub transport: TransportKind,
    pub error: TransportError,
}

pub struct DualTransportExecutor {
    strategies: Vec<Arc<dyn SqlTransport>>,
}

impl DualTransportExecutor {
    pub fn new(direct: Option<Arc<dyn SqlTransport>>, bridge: Arc<dyn SqlTransport>) -> Self {
        let mut strategies = Vec::with_capacity(2);
        if let Some(direct) = direct {
            strategies.push(direct);
        }
        strategies.push(bridge);
        Self { strategies }
    }

    /// The transport tried first
    pub fn primary(&self) -> TransportKind {
        self.strategies
            .first()
            .map(|t| t.kind())
            .unwrap_or(TransportKind::Bridge)
    }

    pub fn has_direct(&self) -> bool {
        self.strategies.iter().any(|t| t.kind() == TransportKind::Direct)
    }

    pub async fn execute(&self, sql: &str, read_only: bool) -> Result<Vec<Row>> {
        let mut failures: Vec<AttemptFailure> = Vec::new();

        for transport in &self.strategies {
            let kind = transport.kind();
            match transport.execute(sql, read_only).await {
                Ok(rows) => {
                    if failures.is_empty() {
                        debug!(transport = %kind, rows = rows.len(), "SQL executed");
                    } else {
                        info!(
                            transport = %kind,
                            suppressed = failures.len(),
                            rows = rows.len(),
                            "SQL executed via fallback transport"
                        );
                    }
                    return Ok(rows);
                }
                Err(error) => {
                    warn!(transport = %kind, error = %error, read_only, "SQL transport failed");
                    failures.push(AttemptFailure { transport: kind, error });
                }
            }
        }

        Err(surface(failures))
    }
}

fn surface(failures: Vec<AttemptFailure>) -> AdapterError {
    let detail = failures
        .iter()
        .map(|f| format!("{}: {}", f.transport, f.error))
        .collect::<Vec<_>>()
        .join("; ");
    AdapterError::upstream(detail)
}
