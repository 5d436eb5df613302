//! Drives one backup file through the full restore sequence.
//!
//! The sequence is linear: validate paths, connect, optionally decompress,
//! inspect and verify the backup, then restore each contained database in
//! position order. Any failure ends the job. Cancellation is observed only
//! between steps, never while a statement is running, and never between the
//! SINGLE_USER and MULTI_USER statements of one database.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::header::{parse_major_version, BackupHeader};
use super::statements::{self, RestoreDatabase};
use super::{RestoreJob, RestoreOutcome, TempFile};
use crate::archive;
use crate::catalog::BackupFileDescriptor;
use crate::db::connector::DbConnector;
use crate::db::{ConnectParams, Row, SqlSession};
use crate::events::{EventBus, ProgressPhase, RestoreEvent};
use crate::utils::paths;
use crate::utils::{RestoreError, Result};

/// Attempts at renaming one logical file (`name`, `name_`, `name__`).
const RENAME_ATTEMPTS: usize = 3;

/// Paths and server settings a restore needs.
#[derive(Debug, Clone, Default)]
pub struct RestoreSettings {
    /// Backup directory as seen from this machine.
    pub local_path: String,
    /// The same directory as seen from the SQL server.
    pub remote_path: String,
    pub connection: ConnectParams,
}

pub struct RestoreEngine {
    connector: Arc<DbConnector>,
    settings: RestoreSettings,
    events: EventBus<RestoreEvent>,
}

impl RestoreEngine {
    pub fn new(
        connector: Arc<DbConnector>,
        settings: RestoreSettings,
        events: EventBus<RestoreEvent>,
    ) -> Self {
        Self {
            connector,
            settings,
            events,
        }
    }

    /// Restore one backup file and report its terminal outcome.
    pub async fn restore(
        &self,
        descriptor: BackupFileDescriptor,
        cancel: &CancellationToken,
    ) -> RestoreOutcome {
        let mut job = RestoreJob::new(descriptor);

        let header = format!("Restoring {}", job.filename());
        self.events.emit(RestoreEvent::HeaderCurrent(header.clone()));
        self.status(&header);
        self.progress(&mut job, 0);

        let result = self.run(&mut job, cancel).await;
        let outcome = job.finish(result);

        if outcome.success {
            info!(file = %outcome.filename, "Restore succeeded");
            self.events.emit(RestoreEvent::JobSucceeded {
                filename: outcome.filename.clone(),
            });
        } else {
            for line in &outcome.errors {
                error!(file = %outcome.filename, "{}", line);
            }
            self.events.emit(RestoreEvent::JobFailed {
                filename: outcome.filename.clone(),
                errors: outcome.errors.clone(),
            });
        }
        self.events.emit(RestoreEvent::JobFinished(outcome.clone()));

        outcome
    }

    async fn run(&self, job: &mut RestoreJob, cancel: &CancellationToken) -> Result<()> {
        check_cancel(cancel)?;

        let local_path = self.validate_paths()?;
        let tmp_name = paths::random_tmp_name();
        let tmp_local = paths::local_file_path(&local_path, &tmp_name);
        self.probe_writable(&tmp_local)?;

        check_cancel(cancel)?;

        // Fail on bad settings before spending time on decompression.
        self.status("Connecting to SQL server.");
        self.connector.connect(&self.settings.connection).await?;

        check_cancel(cancel)?;

        let bakfile = if job.descriptor.compressed {
            let archive_path = paths::local_file_path(&local_path, &job.descriptor.filename);

            self.status("Looking for end-of-central-directory signature in ZIP archive.");
            archive::precheck_trailer(&archive_path)?;

            check_cancel(cancel)?;

            self.status(&format!("Uncompressing ZIP archive \"{}\"", job.filename()));
            job.temp_file = Some(TempFile::new(tmp_local.clone()));
            self.extract(archive_path, tmp_local, &local_path, cancel)
                .await?;
            paths::remote_file_path(&self.settings.remote_path, &tmp_name)
        } else {
            paths::remote_file_path(&self.settings.remote_path, &job.descriptor.filename)
        };

        self.progress(job, 0);
        check_cancel(cancel)?;

        self.status("Connecting to SQL server.");
        let handle = self.connector.connect(&self.settings.connection).await?;
        let mut guard = handle.lock().await;
        let session: &mut dyn SqlSession = &mut **guard;

        check_cancel(cancel)?;

        self.status("Getting SQL server version");
        let server_version = server_version(session).await?;

        check_cancel(cancel)?;

        self.status(&format!("Getting header information from {}", bakfile));
        let rows = query(session, statements::header_only(&bakfile)).await?;
        let header = BackupHeader::from_rows(&bakfile, &rows)?;
        debug!(
            databases = header.len(),
            backup_version = header.highest_version(),
            server_version,
            "Backup header read"
        );
        header.check_compatible(job.filename(), server_version)?;

        check_cancel(cancel)?;

        self.status(&format!("Verifying backup file \"{}\"", bakfile));
        execute(session, statements::verify_only(&bakfile)).await?;

        check_cancel(cancel)?;

        self.status("Getting DATA and LOG path for SQL server");
        let (data_dir, log_dir) = default_directories(session).await?;

        check_cancel(cancel)?;
        self.progress(job, 0);

        let total = header.len();
        for (done, (position, database)) in header.databases().enumerate() {
            check_cancel(cancel)?;
            self.restore_database(session, &bakfile, position, database, &data_dir, &log_dir)
                .await?;
            self.progress(job, percent(done + 1, total));
        }

        self.status("Success");
        self.progress(job, 100);
        Ok(())
    }

    fn validate_paths(&self) -> Result<PathBuf> {
        let RestoreSettings {
            local_path,
            remote_path,
            ..
        } = &self.settings;

        if local_path.is_empty() || remote_path.is_empty() {
            return Err(RestoreError::Configuration("Missing backup paths.".to_string()));
        }

        let path = PathBuf::from(local_path);
        if !path.is_dir() {
            return Err(RestoreError::Filesystem(format!(
                "Local backup path \"{}\" does not exist.",
                local_path
            )));
        }
        Ok(path)
    }

    /// Existence checks pass on shares we cannot write to, so actually
    /// create and remove a file.
    fn probe_writable(&self, probe: &Path) -> Result<()> {
        File::create(probe).map_err(|e| {
            debug!(path = %probe.display(), error = %e, "Probe file could not be created");
            RestoreError::Filesystem(format!(
                "Local backup path \"{}\" is not writable.",
                self.settings.local_path
            ))
        })?;
        if let Err(e) = std::fs::remove_file(probe) {
            warn!(path = %probe.display(), error = %e, "Failed to remove probe file");
        }
        Ok(())
    }

    async fn extract(
        &self,
        archive_path: PathBuf,
        dest: PathBuf,
        local_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let available = paths::available_space(local_path);
        let events = self.events.clone();
        let cancel = cancel.clone();

        let entry = tokio::task::spawn_blocking(move || {
            let mut last = None;
            archive::extract_first_entry(
                &archive_path,
                &dest,
                available,
                |percent| {
                    if last != Some(percent) {
                        last = Some(percent);
                        events.emit(RestoreEvent::ProgressCurrent {
                            phase: ProgressPhase::Extract,
                            percent,
                        });
                    }
                },
                || cancel.is_cancelled(),
            )
        })
        .await
        .map_err(|e| RestoreError::Filesystem(format!("Extraction task failed: {}", e)))??;

        debug!(
            entry = %entry.name,
            size = %paths::format_bytes(entry.size),
            crc32 = entry.crc32,
            "Archive entry extracted"
        );
        Ok(())
    }

    async fn restore_database(
        &self,
        session: &mut dyn SqlSession,
        bakfile: &str,
        position: i64,
        database: &str,
        data_dir: &str,
        log_dir: &str,
    ) -> Result<()> {
        let canonical_data = database.to_string();
        let canonical_log = format!("{}_log", database);

        self.status(&format!("Getting logical names for database \"{}\"", database));
        let rows = query(session, statements::file_list_only(bakfile, position)).await?;
        let mut logical_data = canonical_data.clone();
        let mut logical_log = canonical_log.clone();
        for row in &rows {
            let name = row.text("LogicalName").unwrap_or_default();
            match row.text("Type").unwrap_or_default().to_uppercase().as_str() {
                "D" => logical_data = name,
                "L" => logical_log = name,
                _ => {}
            }
        }

        self.status(&format!("Checking if database \"{}\" exists.", database));
        let rows = query(session, statements::database_state(database)).await?;
        let exists = rows
            .iter()
            .any(|row| row.text("state_desc").as_deref() != Some("RESTORING"));

        let mut db_data_dir = data_dir.to_string();
        let mut db_log_dir = log_dir.to_string();

        if exists {
            self.status(&format!("Setting database \"{}\" to single user.", database));
            execute(session, statements::set_single_user(database)).await?;

            // Keep custom file placement of the existing database.
            self.status(&format!("Getting system filenames for database \"{}\".", database));
            let rows = query(session, statements::system_files(database)).await?;
            let (data, log) = file_directories(&rows);
            if let Some(dir) = data {
                db_data_dir = dir;
            }
            if let Some(dir) = log {
                db_log_dir = dir;
            }
        }

        let data_file = paths::join_server_path(&db_data_dir, &format!("{}.mdf", database));
        let log_file = paths::join_server_path(&db_log_dir, &format!("{}_log.ldf", database));

        self.status(&format!("Restoring database \"{}\".", database));
        let restore = RestoreDatabase {
            database,
            bakfile,
            position,
            logical_data: &logical_data,
            data_file: &data_file,
            logical_log: &logical_log,
            log_file: &log_file,
        };
        execute(session, restore.to_sql()).await?;

        if logical_data != canonical_data {
            self.status(&format!("Setting logical names for database \"{}\".", database));
            rename_logical_file(session, database, &logical_data, &canonical_data).await;
        }
        if logical_log != canonical_log {
            self.status(&format!("Setting logical names for database \"{}\".", database));
            rename_logical_file(session, database, &logical_log, &canonical_log).await;
        }

        self.status(&format!("Setting database \"{}\" to multi user.", database));
        execute(session, statements::set_multi_user(database)).await?;

        info!(database = %database, position, "Database restored");
        Ok(())
    }

    fn status(&self, message: &str) {
        debug!("{}", message);
        self.events.emit(RestoreEvent::StatusCurrent(message.to_string()));
    }

    fn progress(&self, job: &mut RestoreJob, percent: u8) {
        job.progress = percent;
        self.events.emit(RestoreEvent::ProgressCurrent {
            phase: ProgressPhase::Restore,
            percent,
        });
    }
}

fn check_cancel(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(RestoreError::Cancelled);
    }
    Ok(())
}

fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done as f64 / total as f64) * 100.0) as u8
}

async fn query(session: &mut dyn SqlSession, sql: String) -> Result<Vec<Row>> {
    match session.query(&sql).await {
        Ok(rows) => Ok(rows),
        Err(e) => Err(RestoreError::Protocol {
            message: e.0,
            statement: sql,
        }),
    }
}

async fn execute(session: &mut dyn SqlSession, sql: String) -> Result<()> {
    match session.execute(&sql).await {
        Ok(()) => Ok(()),
        Err(e) => Err(RestoreError::Protocol {
            message: e.0,
            statement: sql,
        }),
    }
}

/// Major version of the server, 0 when it cannot be determined.
async fn server_version(session: &mut dyn SqlSession) -> Result<i64> {
    let rows = query(session, statements::SERVER_VERSION.to_string()).await?;
    let version = rows
        .first()
        .and_then(|row| row.get_index(0))
        .and_then(|value| value.as_text())
        .map(|text| parse_major_version(&text))
        .unwrap_or(0);
    debug!(server_version = version, "Server version");
    Ok(version)
}

/// Default DATA and LOG directories, taken from where `master` lives.
async fn default_directories(session: &mut dyn SqlSession) -> Result<(String, String)> {
    let rows = query(session, statements::master_files()).await?;

    let mut data_dir = String::new();
    let mut log_dir = String::new();
    for row in &rows {
        let physical = row.text("PhysicalName").unwrap_or_default();
        let dir = paths::parent_dir(physical.trim()).unwrap_or_default().to_string();
        match row.text("TypeofFile").unwrap_or_default().to_uppercase().as_str() {
            "ROWS" => data_dir = dir,
            "LOG" => log_dir = dir,
            _ => {}
        }
    }

    if data_dir.is_empty() || log_dir.is_empty() {
        return Err(RestoreError::Structural(
            "Unable to get DATA or LOG path for SQL server.".to_string(),
        ));
    }
    Ok((data_dir, log_dir))
}

/// Data and log directories from `sysfiles` rows. The column is fixed width,
/// so values are trimmed first.
fn file_directories(rows: &[Row]) -> (Option<String>, Option<String>) {
    let mut data = None;
    let mut log = None;
    for row in rows {
        let filename = row
            .get_index(0)
            .and_then(|v| v.as_text())
            .unwrap_or_default();
        let filename = filename.trim();
        let lower = filename.to_lowercase();
        let dir = paths::parent_dir(filename).map(str::to_string);
        if lower.contains(".mdf") {
            data = dir;
        } else if lower.contains(".ldf") {
            log = dir;
        }
    }
    (data, log)
}

/// Best effort: the database is already restored, so failures only warn.
async fn rename_logical_file(session: &mut dyn SqlSession, database: &str, old: &str, new: &str) {
    for attempt in 0..RENAME_ATTEMPTS {
        let target = format!("{}{}", new, "_".repeat(attempt));
        let sql = statements::rename_logical_file(database, old, &target);
        match session.execute(&sql).await {
            Ok(()) => {
                debug!(database = %database, from = %old, to = %target, "Renamed logical file");
                return;
            }
            Err(e) => {
                warn!(database = %database, from = %old, to = %target, error = %e, "Failed to rename logical file");
            }
        }
    }
    warn!(database = %database, logical_name = %old, "Keeping original logical file name");
}
