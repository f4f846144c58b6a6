pub mod common;
pub mod completions;
pub mod conflicts;
pub mod init_db;
pub mod integrity;
pub mod orphans;
pub mod uploads;
