//! fieldsync-core - Core library for fieldsync
//!
//! This crate holds the replicated schema, the CRDT change store and
//! applicator, photo storage and the background services shared by the API
//! server and the CLI.

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod schema;
pub mod services;
pub mod storage;
pub mod sync;
pub mod util;

pub use error::{Error, Result};
