pub mod advisory;
pub mod db;
pub mod error;
pub mod event_writer;
pub mod queries;
pub mod records;
pub mod schema;
pub mod time;

pub use advisory::{AdvisoryLockManager, LockGuard, LockNamespace, lock_key_from_string};
pub use db::{Database, Storage};
pub use error::{Error, Result};
pub use event_writer::{EventWriter, WriteResult, WriterMetrics, validate_payload};
