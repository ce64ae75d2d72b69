//! Adapter configuration
//!
//! Non-secret settings live in a TOML file; keys come from the environment
//! and are never written back to disk.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const ENV_URL: &str = "SUPABASE_URL";
pub const ENV_SERVICE_ROLE_KEY: &str = "SUPABASE_SERVICE_ROLE_KEY";
pub const ENV_ANON_KEY: &str = "SUPABASE_ANON_KEY";
pub const ENV_DB_URL: &str = "SUPABASE_DB_URL";
pub const ENV_FUNCTIONS_DIR: &str = "SUPABASE_FUNCTIONS_DIR";

/// Configuration as stored in `config.toml`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Base URL of the self-hosted API gateway (Kong)
    #[serde(default)]
    pub url: String,
    /// Optional direct Postgres connection string
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub functions: FunctionsConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000".to_string(),
            database_url: None,
            bridge: BridgeConfig::default(),
            functions: FunctionsConfig::default(),
            store: StoreConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Name of the remote procedure exposed under `/rest/v1/rpc/`
    pub rpc_function: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            rpc_function: "execute_sql".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionsConfig {
    /// Directory the edge runtime watches; materialization is skipped when unset
    pub dir: Option<PathBuf>,
    /// Endpoint notified after each materialization
    pub reload_url: Option<String>,
}

/// Where function records are persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// PostgREST tables on the self-hosted instance
    #[default]
    Rest,
    /// Embedded SQLite file
    Sqlite,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    pub sqlite_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8085".to_string(),
        }
    }
}

/// Fully resolved settings: file values with environment overrides and secrets applied
#[derive(Debug, Clone)]
pub struct Settings {
    pub config: AdapterConfig,
    pub service_role_key: String,
    pub anon_key: Option<String>,
}

impl Settings {
    /// Resolve settings from a config file (missing file means defaults) and the environment
    pub fn load(config_path: &Path) -> Result<Self> {
        let config = load_config(config_path)?;
        Self::from_env(config, |key| std::env::var(key).ok())
    }

    /// Apply environment overrides using `lookup` for variable access
    pub fn from_env(mut config: AdapterConfig, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(url) = lookup(ENV_URL) {
            config.url = url;
        }
        if let Some(db_url) = lookup(ENV_DB_URL) {
            config.database_url = Some(db_url);
        }
        if let Some(dir) = lookup(ENV_FUNCTIONS_DIR) {
            config.functions.dir = Some(PathBuf::from(dir));
        }

        if config.url.trim().is_empty() {
            return Err(anyhow!("Supabase URL not configured (set `url` or {})", ENV_URL));
        }

        let service_role_key = lookup(ENV_SERVICE_ROLE_KEY)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| anyhow!("{} environment variable not set", ENV_SERVICE_ROLE_KEY))?;

        Ok(Self {
            config,
            service_role_key,
            anon_key: lookup(ENV_ANON_KEY).filter(|k| !k.is_empty()),
        })
    }
}

/// Default config location: `<config_dir>/supabase-selfhost/config.toml`
pub fn default_config_path() -> Result<PathBuf> {
    let base = dirs::config_dir().ok_or_else(|| anyhow!("Could not find config directory"))?;
    Ok(base.join("supabase-selfhost").join("config.toml"))
}

/// Load configuration from file
pub fn load_config(config_path: &Path) -> Result<AdapterConfig> {
    if !config_path.exists() {
        return Ok(AdapterConfig::default());
    }

    let content = std::fs::read_to_string(config_path)?;
    let config: AdapterConfig = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &AdapterConfig, config_path: &Path) -> Result<()> {
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = toml::to_string_pretty(config)?;
    std::fs::write(config_path, content)?;
    Ok(())
}
