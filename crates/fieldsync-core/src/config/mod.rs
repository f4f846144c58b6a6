//! Runtime configuration read from environment variables.
//!
//! Every loader has a `from_lookup` form taking the variable source as a
//! closure so tests never touch the process environment.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::services::{OrphanAuditor, PhotoIntegrityAuditor, UploadQueueConfig};
use crate::storage::{
    parse_s3_config, BreakerConfig, LocalObjectStore, MemoryObjectStore, ObjectStore, S3Config,
    S3ObjectStore, ENV_PUBLIC_BASE_URL,
};
use crate::util::{is_http_url, lookup_trimmed};
use crate::{Error, Result};

const ENV_PROVIDER: &str = "CLOUD_STORAGE_PROVIDER";
const ENV_LOCAL_PATH: &str = "CLOUD_STORAGE_LOCAL_PATH";
const ENV_SPOOL_DIR: &str = "FIELDSYNC_SPOOL_DIR";
const ENV_UPLOAD_INTERVAL: &str = "UPLOAD_CHECK_INTERVAL_SECS";
const ENV_UPLOAD_MAX_RETRIES: &str = "UPLOAD_MAX_RETRIES";
const ENV_UPLOAD_BACKOFF: &str = "UPLOAD_BASE_BACKOFF_SECS";
const ENV_ORPHAN_INTERVAL: &str = "ORPHAN_CHECK_INTERVAL_HOURS";
const ENV_INTEGRITY_INTERVAL: &str = "INTEGRITY_CHECK_INTERVAL_HOURS";
const ENV_BREAKER_FAILURES: &str = "BREAKER_FAILURE_THRESHOLD";
const ENV_BREAKER_SUCCESSES: &str = "BREAKER_SUCCESS_THRESHOLD";
const ENV_BREAKER_COOLDOWN: &str = "BREAKER_COOLDOWN_SECS";

const DEFAULT_OBJECT_DIR: &str = "./fieldsync-data/objects";
const DEFAULT_SPOOL_DIR: &str = "./fieldsync-data/spool";

/// Which object store backs cloud storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    S3(S3Config),
    Local {
        root: PathBuf,
        public_base_url: Option<String>,
    },
    /// Objects live in process memory and vanish on exit.
    Memory,
}

impl StorageConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// `CLOUD_STORAGE_PROVIDER` picks `s3`, `local` or `memory`. When unset,
    /// S3 is used if its variables are present and the local store otherwise.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let read = |key: &str| lookup_trimmed(&lookup, key);
        let s3 = parse_s3_config(&lookup)?;
        let local = || -> Result<Self> {
            let public_base_url = match read(ENV_PUBLIC_BASE_URL) {
                Some(url) if !is_http_url(&url) => {
                    return Err(Error::InvalidInput(format!(
                        "{ENV_PUBLIC_BASE_URL} must start with http:// or https://"
                    )));
                }
                other => other,
            };
            Ok(Self::Local {
                root: read(ENV_LOCAL_PATH)
                    .map_or_else(|| PathBuf::from(DEFAULT_OBJECT_DIR), PathBuf::from),
                public_base_url,
            })
        };

        match read(ENV_PROVIDER).map(|raw| raw.to_ascii_lowercase()).as_deref() {
            Some("s3" | "r2") => s3.map(Self::S3).ok_or_else(|| {
                Error::InvalidInput(format!(
                    "{ENV_PROVIDER}=s3 requires CLOUD_STORAGE_BUCKET and credentials"
                ))
            }),
            Some("local") => local(),
            Some("memory") => Ok(Self::Memory),
            Some(other) => Err(Error::InvalidInput(format!(
                "unknown {ENV_PROVIDER} `{other}` (expected s3, local or memory)"
            ))),
            None => s3.map_or_else(local, |config| Ok(Self::S3(config))),
        }
    }

    pub const fn provider_name(&self) -> &'static str {
        match self {
            Self::S3(_) => "s3",
            Self::Local { .. } => "local",
            Self::Memory => "memory",
        }
    }

    pub fn build_object_store(&self) -> Result<Arc<dyn ObjectStore>> {
        let store: Arc<dyn ObjectStore> = match self {
            Self::S3(config) => Arc::new(S3ObjectStore::new(config.clone())?),
            Self::Local {
                root,
                public_base_url,
            } => Arc::new(LocalObjectStore::new(root.clone(), public_base_url.clone())?),
            Self::Memory => Arc::new(MemoryObjectStore::new()),
        };
        tracing::info!(provider = self.provider_name(), "Object store ready");
        Ok(store)
    }
}

/// Background service tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub upload: UploadQueueConfig,
    pub breaker: BreakerConfig,
    pub orphan_interval: Duration,
    pub integrity_interval: Duration,
    pub spool_dir: PathBuf,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            upload: UploadQueueConfig::default(),
            breaker: BreakerConfig::default(),
            orphan_interval: OrphanAuditor::DEFAULT_INTERVAL,
            integrity_interval: PhotoIntegrityAuditor::DEFAULT_INTERVAL,
            spool_dir: PathBuf::from(DEFAULT_SPOOL_DIR),
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let read = |key: &str| lookup_trimmed(&lookup, key);
        let defaults = Self::default();

        let upload = UploadQueueConfig {
            check_interval: seconds(read, ENV_UPLOAD_INTERVAL)?
                .unwrap_or(defaults.upload.check_interval),
            max_retries: positive(read, ENV_UPLOAD_MAX_RETRIES)?
                .unwrap_or(defaults.upload.max_retries),
            base_backoff: seconds(read, ENV_UPLOAD_BACKOFF)?
                .unwrap_or(defaults.upload.base_backoff),
            ..defaults.upload
        };
        let breaker = BreakerConfig {
            failure_threshold: positive(read, ENV_BREAKER_FAILURES)?
                .unwrap_or(defaults.breaker.failure_threshold),
            success_threshold: positive(read, ENV_BREAKER_SUCCESSES)?
                .unwrap_or(defaults.breaker.success_threshold),
            cooldown: seconds(read, ENV_BREAKER_COOLDOWN)?.unwrap_or(defaults.breaker.cooldown),
        };
        let hours = |key| -> Result<Option<Duration>> {
            Ok(positive::<u64>(read, key)?
                .map(|hours| Duration::from_secs(hours.saturating_mul(60 * 60))))
        };

        Ok(Self {
            upload,
            breaker,
            orphan_interval: hours(ENV_ORPHAN_INTERVAL)?.unwrap_or(defaults.orphan_interval),
            integrity_interval: hours(ENV_INTEGRITY_INTERVAL)?
                .unwrap_or(defaults.integrity_interval),
            spool_dir: read(ENV_SPOOL_DIR)
                .or_else(|| read(ENV_LOCAL_PATH))
                .map_or(defaults.spool_dir, PathBuf::from),
        })
    }
}

/// Parse a positive integer variable.
fn positive<T>(read: impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr + PartialOrd + Default,
{
    let Some(raw) = read(key) else {
        return Ok(None);
    };
    match raw.parse::<T>() {
        Ok(value) if value > T::default() => Ok(Some(value)),
        _ => Err(Error::InvalidInput(format!(
            "{key} must be a positive integer, got `{raw}`"
        ))),
    }
}

fn seconds(read: impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<Duration>> {
    Ok(positive::<u64>(read, key)?.map(Duration::from_secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn storage_defaults_to_local_directory() {
        let config = StorageConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(
            config,
            StorageConfig::Local {
                root: PathBuf::from(DEFAULT_OBJECT_DIR),
                public_base_url: None,
            }
        );
    }

    #[test]
    fn storage_prefers_s3_when_configured() {
        let config = StorageConfig::from_lookup(lookup(&[
            ("CLOUD_STORAGE_BUCKET", "photos"),
            ("CLOUD_STORAGE_ACCESS_KEY", "key"),
            ("CLOUD_STORAGE_SECRET_KEY", "secret"),
        ]))
        .unwrap();
        assert_eq!(config.provider_name(), "s3");

        let forced = StorageConfig::from_lookup(lookup(&[
            ("CLOUD_STORAGE_PROVIDER", "local"),
            ("CLOUD_STORAGE_BUCKET", "photos"),
            ("CLOUD_STORAGE_ACCESS_KEY", "key"),
            ("CLOUD_STORAGE_SECRET_KEY", "secret"),
            ("CLOUD_STORAGE_LOCAL_PATH", "/srv/objects"),
        ]))
        .unwrap();
        assert_eq!(
            forced,
            StorageConfig::Local {
                root: PathBuf::from("/srv/objects"),
                public_base_url: None,
            }
        );
    }

    #[test]
    fn storage_rejects_bad_provider_settings() {
        assert!(StorageConfig::from_lookup(lookup(&[("CLOUD_STORAGE_PROVIDER", "ftp")])).is_err());
        assert!(StorageConfig::from_lookup(lookup(&[("CLOUD_STORAGE_PROVIDER", "s3")])).is_err());
        assert!(StorageConfig::from_lookup(lookup(&[(
            "CLOUD_STORAGE_PUBLIC_BASE_URL",
            "cdn.example.com"
        )]))
        .is_err());
        assert_eq!(
            StorageConfig::from_lookup(lookup(&[("CLOUD_STORAGE_PROVIDER", "Memory")])).unwrap(),
            StorageConfig::Memory
        );
    }

    #[test]
    fn memory_store_builds() {
        let store = StorageConfig::Memory.build_object_store().unwrap();
        assert_eq!(store.name(), "memory");
    }

    #[test]
    fn service_config_defaults() {
        let config = ServiceConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ServiceConfig::default());
        assert_eq!(config.upload.max_retries, 5);
        assert_eq!(config.breaker.cooldown, Duration::from_secs(300));
        assert_eq!(config.orphan_interval, Duration::from_secs(6 * 60 * 60));
    }

    #[test]
    fn service_config_reads_overrides() {
        let config = ServiceConfig::from_lookup(lookup(&[
            ("UPLOAD_CHECK_INTERVAL_SECS", "5"),
            ("UPLOAD_MAX_RETRIES", "3"),
            ("UPLOAD_BASE_BACKOFF_SECS", "10"),
            ("ORPHAN_CHECK_INTERVAL_HOURS", "1"),
            ("INTEGRITY_CHECK_INTERVAL_HOURS", "2"),
            ("BREAKER_FAILURE_THRESHOLD", "2"),
            ("BREAKER_SUCCESS_THRESHOLD", "1"),
            ("BREAKER_COOLDOWN_SECS", "30"),
            ("CLOUD_STORAGE_LOCAL_PATH", "/srv/objects"),
        ]))
        .unwrap();
        assert_eq!(config.upload.check_interval, Duration::from_secs(5));
        assert_eq!(config.upload.max_retries, 3);
        assert_eq!(config.upload.base_backoff, Duration::from_secs(10));
        assert_eq!(config.orphan_interval, Duration::from_secs(3600));
        assert_eq!(config.integrity_interval, Duration::from_secs(7200));
        assert_eq!(
            config.breaker,
            BreakerConfig {
                failure_threshold: 2,
                success_threshold: 1,
                cooldown: Duration::from_secs(30),
            }
        );
        assert_eq!(config.spool_dir, PathBuf::from("/srv/objects"));
    }

    #[test]
    fn service_config_rejects_invalid_numbers() {
        for (key, value) in [
            ("UPLOAD_MAX_RETRIES", "0"),
            ("UPLOAD_CHECK_INTERVAL_SECS", "-1"),
            ("BREAKER_COOLDOWN_SECS", "soon"),
        ] {
            let err = ServiceConfig::from_lookup(lookup(&[(key, value)])).unwrap_err();
            assert!(err.to_string().contains(key), "{err}");
        }
    }
}
