//! Runtime configuration read from the environment.

use std::path::PathBuf;

use anyhow::Result;

use crate::db;

const DEFAULT_LOG_FILTER: &str = "jarstore=info";

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database file.
    pub db_path: PathBuf,
    /// `tracing` filter directive.
    pub log_filter: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// - `JARSTORE_DB`: database path (defaults to the platform data dir)
    /// - `RUST_LOG`: log filter (defaults to `jarstore=info`)
    pub fn from_env() -> Result<Self> {
        let db_path = match std::env::var("JARSTORE_DB") {
            Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => db::default_path()?,
        };

        let log_filter = std::env::var("RUST_LOG")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        Ok(Self {
            db_path,
            log_filter,
        })
    }

    /// Override the database path, e.g. from a CLI flag.
    pub fn with_db_path(mut self, path: Option<PathBuf>) -> Self {
        if let Some(path) = path {
            self.db_path = path;
        }
        self
    }
}
