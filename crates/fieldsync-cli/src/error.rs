use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] fieldsync_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Photo id cannot be empty")]
    EmptyPhotoId,
    #[error("{0} orphaned row(s) remain")]
    OrphansRemain(usize),
    #[error("{0} corrupted photo(s) found")]
    CorruptionFound(usize),
}
