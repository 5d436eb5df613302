//! Utility modules for the restore tool.

pub mod errors;
pub mod logger;
pub mod paths;

pub use errors::{RestoreError, Result};
