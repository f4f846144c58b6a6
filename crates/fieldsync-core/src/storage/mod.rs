//! Photo content storage: hashing, thumbnails, object stores and the
//! breaker-protected cloud client.

mod breaker;
mod cloud;
mod hash;
mod local;
mod memory;
mod object_store;
mod s3;
mod thumbnail;

pub use breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use cloud::{CloudStorageClient, PhotoObjectNames, UploadedPhoto};
pub use hash::{hash_bytes, hash_file, is_valid_digest, HASH_ALGORITHM};
pub use local::LocalObjectStore;
pub use memory::MemoryObjectStore;
pub use object_store::{key_from_url_path, CloudError, ObjectStore};
pub use s3::{S3Config, S3ObjectStore};
pub(crate) use s3::{parse_config as parse_s3_config, ENV_PUBLIC_BASE_URL};
pub use thumbnail::{
    generate_thumbnail, generate_thumbnail_from_path, Thumbnail, ThumbnailError, ThumbnailOptions,
};

#[cfg(test)]
pub(crate) use thumbnail::tests::source_png;
