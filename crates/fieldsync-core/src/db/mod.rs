//! Database layer for fieldsync

mod changes;
mod conflicts;
mod connection;
mod migrations;
mod photos;

pub use changes::{ChangeStore, MergeOutcome, SqliteChangeStore, StoredChange};
pub use conflicts::ConflictRepository;
pub use connection::{Database, SharedDatabase};
pub use photos::{text, PhotoRepository};

#[cfg(test)]
pub(crate) use changes::tests as change_fixtures;
