//! Error taxonomy for restore jobs.
//!
//! Every variant is terminal for the job that produced it and never leaks
//! into sibling jobs in the queue.

use crate::archive::ArchiveError;
use crate::db::connector::ConnectorError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RestoreError {
    /// Missing paths or credentials, detected before any I/O.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Permission, existence or disk-space problems on the local path.
    #[error("{0}")]
    Filesystem(String),

    #[error(transparent)]
    Archive(ArchiveError),

    /// Driver, authentication or login-timeout failure.
    #[error("{0}")]
    Connection(String),

    /// A failing SQL statement, carrying the server text and the statement.
    #[error("{message}")]
    Protocol { message: String, statement: String },

    /// Backup was taken on a newer server than the target.
    #[error("{0}")]
    VersionIncompatibility(String),

    /// Position collisions, non-full backups or empty metadata.
    #[error("{0}")]
    Structural(String),

    #[error("Restore cancelled.")]
    Cancelled,
}

impl RestoreError {
    /// Ordered error lines as reported in a `RestoreOutcome`.
    pub fn error_lines(&self) -> Vec<String> {
        match self {
            RestoreError::Protocol { message, statement } => {
                vec![message.clone(), statement.clone()]
            }
            other => vec![other.to_string()],
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RestoreError::Cancelled)
    }
}

impl From<ArchiveError> for RestoreError {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::Cancelled => RestoreError::Cancelled,
            other => RestoreError::Archive(other),
        }
    }
}

impl From<ConnectorError> for RestoreError {
    fn from(err: ConnectorError) -> Self {
        match err {
            ConnectorError::MissingParameters => {
                RestoreError::Configuration(ConnectorError::MissingParameters.to_string())
            }
            ConnectorError::Connect(message) => RestoreError::Connection(message),
        }
    }
}

pub type Result<T> = std::result::Result<T, RestoreError>;
