//! Backup candidates found in the local backup path.
//!
//! A scan lists the top level of the directory and classifies each file by
//! its leading bytes, falling back to the file extension. `BackupCatalog`
//! keeps the last scan keyed by filename and reports what changed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use crate::utils::{RestoreError, Result};

const ZIP_LOCAL_HEADER: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];
/// Microsoft Tape Format descriptor block that opens a SQL Server backup.
const MTF_TAPE_HEADER: [u8; 4] = *b"TAPE";

pub const MIME_ZIP: &str = "application/zip";
pub const MIME_SQL_BACKUP: &str = "application/x-mssql-backup";
pub const MIME_UNKNOWN: &str = "application/octet-stream";

/// A candidate backup file. Identity is the filename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupFileDescriptor {
    pub filename: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub compressed: bool,
    pub file_type: String,
}

impl BackupFileDescriptor {
    pub fn new(filename: impl Into<String>, size: u64, compressed: bool) -> Self {
        Self {
            filename: filename.into(),
            size,
            modified: Utc::now(),
            compressed,
            file_type: if compressed { MIME_ZIP } else { MIME_SQL_BACKUP }.to_string(),
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.filename.is_empty()
    }
}

/// List and classify the backup candidates directly inside `root`.
pub fn scan_directory(root: &Path) -> Result<Vec<BackupFileDescriptor>> {
    if !root.is_dir() {
        return Err(RestoreError::Filesystem(format!(
            "Local backup path {} does not exist.",
            root.display()
        )));
    }

    let mut files = Vec::new();
    let walker = WalkDir::new(root).min_depth(1).max_depth(1).sort_by_file_name();

    for entry in walker {
        let entry = entry.map_err(|e| {
            RestoreError::Filesystem(format!("Unable to read {}: {}", root.display(), e))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let filename = entry.file_name().to_string_lossy().to_string();
        if filename.to_lowercase().ends_with(".tmp") {
            debug!(file = %filename, "Skipping temp file");
            continue;
        }

        match classify(&entry) {
            Ok(Some(descriptor)) => files.push(descriptor),
            Ok(None) => debug!(file = %filename, "Skipped file, not a SQL backup or ZIP archive"),
            Err(e) => warn!(file = %filename, error = %e, "Unable to inspect file"),
        }
    }

    Ok(files)
}

fn classify(entry: &DirEntry) -> std::io::Result<Option<BackupFileDescriptor>> {
    let metadata = entry.metadata()?;
    let filename = entry.file_name().to_string_lossy().to_string();

    let mut magic = [0u8; 4];
    let mut file = File::open(entry.path())?;
    let read = read_prefix(&mut file, &mut magic)?;

    let lower = filename.to_lowercase();
    let (compressed, file_type) = if read == 4 && magic == ZIP_LOCAL_HEADER {
        (true, MIME_ZIP)
    } else if read == 4 && magic == MTF_TAPE_HEADER {
        (false, MIME_SQL_BACKUP)
    } else if lower.ends_with(".zip") {
        (true, MIME_ZIP)
    } else if lower.ends_with(".bak") || lower.ends_with(".ubk") {
        (false, MIME_UNKNOWN)
    } else {
        return Ok(None);
    };

    let modified = metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());

    Ok(Some(BackupFileDescriptor {
        filename,
        size: metadata.len(),
        modified,
        compressed,
        file_type: file_type.to_string(),
    }))
}

fn read_prefix(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Differences between two scans.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogChanges {
    pub added: Vec<BackupFileDescriptor>,
    pub updated: Vec<BackupFileDescriptor>,
    pub deleted: Vec<BackupFileDescriptor>,
}

impl CatalogChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackupCatalog {
    files: BTreeMap<String, BackupFileDescriptor>,
}

impl BackupCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the catalog with `scan` and report the differences.
    pub fn apply(&mut self, scan: Vec<BackupFileDescriptor>) -> CatalogChanges {
        let mut changes = CatalogChanges::default();
        let mut seen = BTreeMap::new();

        for descriptor in scan.into_iter().filter(BackupFileDescriptor::is_valid) {
            match self.files.get(&descriptor.filename) {
                Some(old) if *old == descriptor => {}
                Some(_) => {
                    debug!(file = %descriptor.filename, "File changed");
                    changes.updated.push(descriptor.clone());
                }
                None => {
                    debug!(file = %descriptor.filename, "New file");
                    changes.added.push(descriptor.clone());
                }
            }
            seen.insert(descriptor.filename.clone(), descriptor);
        }

        for (filename, old) in std::mem::take(&mut self.files) {
            if !seen.contains_key(&filename) {
                debug!(file = %filename, "File deleted");
                changes.deleted.push(old);
            }
        }

        self.files = seen;
        changes
    }

    pub fn get(&self, filename: &str) -> Option<&BackupFileDescriptor> {
        self.files.get(filename)
    }

    /// Descriptors in filename order.
    pub fn files(&self) -> impl Iterator<Item = &BackupFileDescriptor> {
        self.files.values()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
