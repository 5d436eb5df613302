//! SQL Server restore library.
//!
//! Restores plain or ZIP-compressed SQL Server backups from a local backup
//! directory onto a SQL server that sees the same directory under its own
//! path. Jobs run one at a time through [`queue::service::RestoreService`].

pub mod archive;
pub mod catalog;
pub mod config;
pub mod daemon;
pub mod db;
pub mod events;
pub mod queue;
pub mod restore;
pub mod utils;

// Re-export commonly used types
pub use catalog::BackupFileDescriptor;
pub use config::Config;
pub use events::RestoreEvent;
pub use queue::service::{RestoreService, RestoreServiceHandle};
pub use restore::{RestoreOutcome, RestoreSettings};
pub use utils::errors::RestoreError;
pub type Result<T> = std::result::Result<T, RestoreError>;
