//! Daemon configuration -- TOML file with sensible defaults.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bind address for the API server.
    pub bind: String,
    /// Path to the SQLite record store.
    pub db_path: String,
    /// Monitor poll period in milliseconds.
    pub monitor_period_ms: u64,
    /// Concurrent in-flight events per run dispatcher.
    pub dispatcher_concurrency: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            db_path: "data/benchpilot.db".to_string(),
            monitor_period_ms: 5_000,
            dispatcher_concurrency: 1,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, or defaults if the path is absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("Failed to read config file {}", p.display()))?;
                let cfg: Config = toml::from_str(&raw)
                    .with_context(|| format!("Invalid config file {}", p.display()))?;
                Ok(cfg)
            }
            None => Ok(Config::default()),
        }
    }
}
