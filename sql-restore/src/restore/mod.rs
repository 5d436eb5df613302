//! Restore protocol: job state, SQL statements, header parsing and the
//! engine that drives one backup file onto the server.

pub mod engine;
pub mod header;
pub mod statements;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::catalog::BackupFileDescriptor;
use crate::utils::RestoreError;

pub use engine::{RestoreEngine, RestoreSettings};

/// Terminal result of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreOutcome {
    pub filename: String,
    pub success: bool,
    pub errors: Vec<String>,
}

/// A temporary file owned by a job, removed when dropped.
#[derive(Debug)]
pub struct TempFile {
    path: PathBuf,
}

impl TempFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "Failed to remove temporary file");
            }
        }
    }
}

/// One backup file plus the transient state of its restore.
#[derive(Debug)]
pub struct RestoreJob {
    pub descriptor: BackupFileDescriptor,
    pub temp_file: Option<TempFile>,
    pub progress: u8,
    pub errors: Vec<String>,
    pub success: bool,
    pub complete: bool,
}

impl RestoreJob {
    pub fn new(descriptor: BackupFileDescriptor) -> Self {
        Self {
            descriptor,
            temp_file: None,
            progress: 0,
            errors: Vec::new(),
            success: false,
            complete: false,
        }
    }

    pub fn filename(&self) -> &str {
        &self.descriptor.filename
    }

    /// Record the terminal result and release the temporary file.
    pub fn finish(&mut self, result: Result<(), RestoreError>) -> RestoreOutcome {
        self.temp_file = None;
        self.complete = true;
        match result {
            Ok(()) => {
                self.success = true;
                self.progress = 100;
            }
            Err(e) => {
                self.success = false;
                self.errors.extend(e.error_lines());
            }
        }
        RestoreOutcome {
            filename: self.descriptor.filename.clone(),
            success: self.success,
            errors: self.errors.clone(),
        }
    }
}

/// Closing summary for a finished batch.
pub fn batch_summary(outcomes: &[RestoreOutcome]) -> String {
    let failed = outcomes.iter().filter(|o| !o.success).count();
    let total = outcomes.len();
    match failed {
        0 if total == 1 => "Restore completed successfully.".to_string(),
        0 => format!("All {} restores completed successfully.", total),
        1 if total == 1 => "Restore failed.".to_string(),
        1 => format!("1 of {} restores failed.", total),
        n => format!("{} of {} restores failed.", n, total),
    }
}
