//! S3-compatible object store (AWS S3, Cloudflare R2, MinIO).

use std::env;
use std::fmt;
use std::future::Future;

use aws_credential_types::Credentials;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::{primitives::ByteStream, Client};
use aws_types::region::Region;
use tokio::runtime::Runtime;

use super::object_store::{key_from_url_path, normalize_object_key, CloudError, ObjectStore};
use crate::util::{is_http_url, lookup_trimmed};
use crate::{Error, Result};

pub(crate) const ENV_BUCKET: &str = "CLOUD_STORAGE_BUCKET";
pub(crate) const ENV_ACCESS_KEY: &str = "CLOUD_STORAGE_ACCESS_KEY";
pub(crate) const ENV_SECRET_KEY: &str = "CLOUD_STORAGE_SECRET_KEY";
pub(crate) const ENV_REGION: &str = "CLOUD_STORAGE_REGION";
pub(crate) const ENV_ENDPOINT: &str = "CLOUD_STORAGE_ENDPOINT";
pub(crate) const ENV_PUBLIC_BASE_URL: &str = "CLOUD_STORAGE_PUBLIC_BASE_URL";

const DEFAULT_REGION: &str = "us-east-1";

/// S3-compatible bucket configuration.
#[derive(Clone, PartialEq, Eq)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Custom endpoint for S3-compatible services; path-style addressing is used.
    pub endpoint_url: Option<String>,
    /// Optional public URL base for serving photos.
    pub public_base_url: Option<String>,
}

impl fmt::Debug for S3Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Config")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("endpoint_url", &self.endpoint_url)
            .field("public_base_url", &self.public_base_url)
            .finish()
    }
}

impl S3Config {
    /// Load configuration from environment variables.
    ///
    /// Returns `Ok(None)` when no bucket variables are set.
    /// Returns an error when only a partial configuration is provided.
    pub fn from_env() -> Result<Option<Self>> {
        parse_config(|key| env::var(key).ok())
    }

    /// URL of an object when no public base URL is configured.
    fn direct_object_url(&self, key: &str) -> String {
        self.endpoint_url.as_ref().map_or_else(
            || format!("https://{}.s3.{}.amazonaws.com/{key}", self.bucket, self.region),
            |endpoint| format!("{endpoint}/{}/{key}", self.bucket),
        )
    }
}

pub(crate) fn parse_config(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<S3Config>> {
    let read = |key: &str| lookup_trimmed(&lookup, key);
    let bucket = read(ENV_BUCKET);
    let access_key_id = read(ENV_ACCESS_KEY);
    let secret_access_key = read(ENV_SECRET_KEY);

    if bucket.is_none() && access_key_id.is_none() && secret_access_key.is_none() {
        return Ok(None);
    }

    let mut missing = Vec::new();
    if bucket.is_none() {
        missing.push(ENV_BUCKET);
    }
    if access_key_id.is_none() {
        missing.push(ENV_ACCESS_KEY);
    }
    if secret_access_key.is_none() {
        missing.push(ENV_SECRET_KEY);
    }
    let (Some(bucket), Some(access_key_id), Some(secret_access_key)) =
        (bucket, access_key_id, secret_access_key)
    else {
        return Err(Error::InvalidInput(format!(
            "Cloud storage configuration is incomplete. Missing: {}",
            missing.join(", ")
        )));
    };

    Ok(Some(S3Config {
        bucket,
        region: read(ENV_REGION).unwrap_or_else(|| DEFAULT_REGION.to_string()),
        access_key_id,
        secret_access_key,
        endpoint_url: normalize_base_url(ENV_ENDPOINT, read(ENV_ENDPOINT))?,
        public_base_url: normalize_base_url(ENV_PUBLIC_BASE_URL, read(ENV_PUBLIC_BASE_URL))?,
    }))
}

fn normalize_base_url(name: &str, value: Option<String>) -> Result<Option<String>> {
    let Some(value) = value else {
        return Ok(None);
    };
    if !is_http_url(&value) {
        return Err(Error::InvalidInput(format!(
            "{name} must start with http:// or https://"
        )));
    }
    Ok(Some(value.trim_end_matches('/').to_string()))
}

/// Blocking S3 driver.
///
/// SDK futures run on an owned runtime, always entered from a fresh scoped
/// thread so callers may sit inside another runtime's blocking pool.
pub struct S3ObjectStore {
    config: S3Config,
    client: Client,
    runtime: Option<Runtime>,
}

impl S3ObjectStore {
    pub fn new(config: S3Config) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("fieldsync-s3")
            .enable_all()
            .build()?;
        let client = build_s3_client(&config);
        Ok(Self {
            config,
            client,
            runtime: Some(runtime),
        })
    }

    pub const fn config(&self) -> &S3Config {
        &self.config
    }

    fn run<T, F>(&self, future: F) -> std::result::Result<T, CloudError>
    where
        F: Future<Output = std::result::Result<T, CloudError>> + Send,
        T: Send,
    {
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| CloudError::Backend("S3 runtime is shut down".into()))?;
        std::thread::scope(|scope| {
            scope
                .spawn(move || runtime.block_on(future))
                .join()
                .unwrap_or_else(|_| Err(CloudError::Backend("S3 worker thread panicked".into())))
        })
    }
}

impl Drop for S3ObjectStore {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl ObjectStore for S3ObjectStore {
    fn name(&self) -> &'static str {
        "s3"
    }

    fn put_object(&self, key: &str, bytes: &[u8], content_type: &str) -> std::result::Result<(), CloudError> {
        let key = normalize_object_key(key)?;
        let bucket = &self.config.bucket;
        let mut request = self
            .client
            .put_object()
            .bucket(bucket)
            .key(&key)
            .body(ByteStream::from(bytes.to_vec()));
        if !content_type.trim().is_empty() {
            request = request.content_type(content_type.trim());
        }

        self.run(async move {
            request
                .send()
                .await
                .map_err(|error| storage_error("put_object", bucket, Some(&key), error))?;
            Ok(())
        })
    }

    fn get_object(&self, key: &str) -> std::result::Result<Vec<u8>, CloudError> {
        let key = normalize_object_key(key)?;
        let bucket = &self.config.bucket;
        let request = self.client.get_object().bucket(bucket).key(&key);

        self.run(async move {
            let response = request.send().await.map_err(|error| {
                if error
                    .as_service_error()
                    .is_some_and(GetObjectError::is_no_such_key)
                {
                    CloudError::NotFound(key.clone())
                } else {
                    storage_error("get_object", bucket, Some(&key), error)
                }
            })?;
            let payload = response
                .body
                .collect()
                .await
                .map_err(|error| storage_error("get_object_body", bucket, Some(&key), error))?;
            Ok(payload.into_bytes().to_vec())
        })
    }

    fn delete_object(&self, key: &str) -> std::result::Result<(), CloudError> {
        let key = normalize_object_key(key)?;
        let bucket = &self.config.bucket;
        let request = self.client.delete_object().bucket(bucket).key(&key);

        self.run(async move {
            request
                .send()
                .await
                .map_err(|error| storage_error("delete_object", bucket, Some(&key), error))?;
            Ok(())
        })
    }

    fn object_url(&self, key: &str) -> String {
        let key = key.trim_matches('/');
        self.config.public_base_url.as_ref().map_or_else(
            || self.config.direct_object_url(key),
            |base| format!("{base}/{key}"),
        )
    }

    fn object_key_from_url(&self, url: &str) -> Option<String> {
        if let Some(base) = &self.config.public_base_url {
            if let Some(rest) = url.strip_prefix(base.as_str()) {
                let key = rest.trim_matches('/');
                return (!key.is_empty()).then(|| key.to_string());
            }
        }
        let key = key_from_url_path(url)?;
        if self.config.endpoint_url.is_some() {
            if let Some(rest) = key.strip_prefix(&format!("{}/", self.config.bucket)) {
                return Some(rest.to_string());
            }
        }
        Some(key)
    }
}

fn build_s3_client(config: &S3Config) -> Client {
    let credentials = Credentials::new(
        config.access_key_id.clone(),
        config.secret_access_key.clone(),
        None,
        None,
        "fieldsync-core-s3-storage",
    );

    let mut builder = aws_sdk_s3::config::Builder::new()
        .region(Region::new(config.region.clone()))
        .credentials_provider(credentials);
    if let Some(endpoint) = &config.endpoint_url {
        builder = builder.endpoint_url(endpoint).force_path_style(true);
    }

    Client::from_conf(builder.build())
}

fn storage_error(
    operation: &str,
    bucket: &str,
    object_key: Option<&str>,
    error: impl fmt::Display,
) -> CloudError {
    let target = object_key.map_or_else(|| bucket.to_string(), |key| format!("{bucket}/{key}"));
    CloudError::Backend(format!("S3 {operation} failed for {target}: {error}"))
}
