//! Object-store driver contract shared by the cloud backends.

use thiserror::Error;
use url::Url;

/// Errors reported by object-store drivers and the cloud client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CloudError {
    /// The circuit breaker is open; the driver was not called.
    #[error("Cloud storage circuit is open; retry after cooldown")]
    CircuitOpen,

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid storage request: {0}")]
    InvalidInput(String),

    /// Transport or service failure.
    #[error("Storage error: {0}")]
    Backend(String),
}

impl CloudError {
    /// Whether the error indicates a degraded backend.
    pub const fn is_backend_failure(&self) -> bool {
        matches!(self, Self::Backend(_))
    }
}

/// Blocking object-store driver.
pub trait ObjectStore: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    fn put_object(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<(), CloudError>;

    fn get_object(&self, key: &str) -> Result<Vec<u8>, CloudError>;

    fn delete_object(&self, key: &str) -> Result<(), CloudError>;

    /// URL under which an object is addressed.
    fn object_url(&self, key: &str) -> String;

    /// Recover an object key from a URL produced by `object_url`.
    fn object_key_from_url(&self, url: &str) -> Option<String> {
        key_from_url_path(url)
    }
}

/// Object key taken from the path component of a URL.
pub fn key_from_url_path(raw: &str) -> Option<String> {
    let url = Url::parse(raw.trim()).ok()?;
    let path = urlencoding::decode(url.path()).ok()?;
    let key = path.trim_matches('/');
    if key.is_empty() {
        None
    } else {
        Some(key.to_string())
    }
}

/// Trim slashes and refuse empty or path-escaping keys.
pub(crate) fn normalize_object_key(object_key: &str) -> Result<String, CloudError> {
    let object_key = object_key.trim().trim_matches('/');
    if object_key.is_empty() {
        return Err(CloudError::InvalidInput("object key cannot be empty".into()));
    }
    if object_key
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(CloudError::InvalidInput(format!(
            "object key `{object_key}` contains an invalid path segment"
        )));
    }
    Ok(object_key.to_string())
}
