use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use fieldsync_core::config::{ServiceConfig, StorageConfig};
use thiserror::Error;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_DATABASE_PATH: &str = "./fieldsync-data/fieldsync.db";
const DEFAULT_MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error(transparent)]
    Core(#[from] fieldsync_core::Error),
}

/// Server configuration. Secrets inside `storage` are redacted by its
/// `Debug` output.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub database_path: PathBuf,
    pub max_upload_bytes: usize,
    pub storage: StorageConfig,
    pub services: ServiceConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "FIELDSYNC_BIND_ADDR", DEFAULT_BIND_ADDR);
        if bind_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "FIELDSYNC_BIND_ADDR must be host:port, got `{bind_addr}`"
            )));
        }

        let database_path = PathBuf::from(value_or_default(
            &lookup,
            "FIELDSYNC_DATABASE_PATH",
            DEFAULT_DATABASE_PATH,
        ));

        let max_upload_bytes = match optional_trimmed(&lookup, "FIELDSYNC_MAX_UPLOAD_BYTES") {
            None => DEFAULT_MAX_UPLOAD_BYTES,
            Some(raw) => raw.parse::<usize>().ok().filter(|bytes| *bytes > 0).ok_or_else(|| {
                ConfigError::Invalid(
                    "FIELDSYNC_MAX_UPLOAD_BYTES must be a positive integer".to_string(),
                )
            })?,
        };

        Ok(Self {
            bind_addr,
            database_path,
            max_upload_bytes,
            storage: StorageConfig::from_lookup(&lookup)?,
            services: ServiceConfig::from_lookup(&lookup)?,
        })
    }
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
