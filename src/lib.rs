//! Self-hosted Supabase data-plane adapter
//!
//! Runs SQL through a direct Postgres connection or the PostgREST RPC bridge,
//! tracks migrations, and manages edge function sources with versioned
//! deploys and best-effort materialization into the runtime's directory.

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod executor;
pub mod fs_sync;
pub mod functions;
pub mod migrations;
pub mod platform;
pub mod redact;
pub mod schema;
pub mod transport;

pub use error::{AdapterError, Result};
pub use platform::{Platform, SelfHostedPlatform};
