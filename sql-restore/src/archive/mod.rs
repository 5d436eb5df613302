//! ZIP read path for compressed backups.
//!
//! Only what a restore needs: a cheap structural precheck of the archive
//! trailer and a verified extraction of the first entry. The bytes written to
//! disk are checksummed independently of the zip crate and compared against
//! the CRC32 recorded in the central directory.

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use zip::ZipArchive;

use crate::utils::paths::format_bytes;

/// Chunk size for trailer reads and entry streaming.
pub const CHUNK_SIZE: usize = 8192;

/// Number of trailing bytes searched for the end-of-central-directory record.
pub const TAIL_SIZE: usize = 8192;

/// End-of-central-directory signature.
pub const EOCD_SIGNATURE: [u8; 4] = [0x50, 0x4B, 0x05, 0x06];

/// Fixed part of the end-of-central-directory record.
const EOCD_MIN_LEN: usize = 22;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("End-of-central-directory signature not found in ZIP archive \"{0}\". File is incomplete or corrupt.")]
    CorruptArchive(String),

    #[error("Unable to open ZIP archive \"{path}\": {reason}")]
    OpenFailed { path: String, reason: String },

    #[error("Backup ZIP archive \"{0}\" has no files.")]
    NoEntries(String),

    #[error("Not enough disk space on \"{dest}\", {available} is available, but {needed} is needed to unzip {entry}.")]
    InsufficientDiskSpace {
        dest: String,
        entry: String,
        available: String,
        needed: String,
    },

    #[error("Unable to read file \"{entry}\" in ZIP archive \"{path}\" (file possibly corrupt): {reason}")]
    ReadFailed {
        path: String,
        entry: String,
        reason: String,
    },

    #[error("Unable to write to temporary file \"{path}\": {reason}")]
    WriteFailed { path: String, reason: String },

    #[error("Unexpected end of file while reading file \"{entry}\" in ZIP archive \"{path}\". File is corrupt.")]
    TruncatedEntry { path: String, entry: String },

    #[error("CRC checksum failed for file \"{entry}\" in ZIP archive \"{path}\". File is corrupt.")]
    ChecksumMismatch {
        path: String,
        entry: String,
        expected: u32,
        actual: u32,
    },

    #[error("Extraction cancelled")]
    Cancelled,
}

/// Metadata of a successfully extracted entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedEntry {
    pub name: String,
    pub size: u64,
    pub crc32: u32,
}

/// Reject archives whose tail lacks an end-of-central-directory record.
///
/// Files up to `2 * CHUNK_SIZE` bytes are not checked.
pub fn precheck_trailer(path: &Path) -> Result<(), ArchiveError> {
    let archive_display = path.display().to_string();
    let open_failed = |e: std::io::Error| ArchiveError::OpenFailed {
        path: archive_display.clone(),
        reason: e.to_string(),
    };

    let mut file = File::open(path).map_err(open_failed)?;
    let len = file.metadata().map_err(open_failed)?.len();
    if len <= (CHUNK_SIZE * 2) as u64 {
        debug!(archive = %archive_display, len, "Archive too small for trailer precheck");
        return Ok(());
    }

    file.seek(SeekFrom::Start(len - TAIL_SIZE as u64))
        .map_err(open_failed)?;
    let mut tail = vec![0u8; TAIL_SIZE];
    file.read_exact(&mut tail).map_err(open_failed)?;

    if find_eocd(&tail).is_none() {
        return Err(ArchiveError::CorruptArchive(archive_display));
    }
    Ok(())
}

/// Offset of the last end-of-central-directory signature that still leaves
/// room for the fixed record behind it.
fn find_eocd(buf: &[u8]) -> Option<usize> {
    if buf.len() < EOCD_MIN_LEN {
        return None;
    }
    let last_start = buf.len() - EOCD_MIN_LEN;
    (0..=last_start)
        .rev()
        .find(|&i| buf[i..i + EOCD_SIGNATURE.len()] == EOCD_SIGNATURE)
}

/// Removes a partially written destination unless kept.
struct PartialFile {
    path: PathBuf,
    keep: bool,
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.keep && self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "Failed to remove partial file");
            }
        }
    }
}

/// Stream the first entry of `archive_path` into `dest_path`.
///
/// `available_bytes` is the free space at the destination, `None` when it
/// cannot be determined (the check is skipped). `on_progress` receives the
/// written percentage after every chunk and `is_cancelled` is polled before
/// every chunk. The destination exists afterwards only on success.
pub fn extract_first_entry<P, C>(
    archive_path: &Path,
    dest_path: &Path,
    available_bytes: Option<u64>,
    mut on_progress: P,
    is_cancelled: C,
) -> Result<ExtractedEntry, ArchiveError>
where
    P: FnMut(u8),
    C: Fn() -> bool,
{
    let archive_display = archive_path.display().to_string();
    let dest_display = dest_path.display().to_string();

    let file = File::open(archive_path).map_err(|e| ArchiveError::OpenFailed {
        path: archive_display.clone(),
        reason: e.to_string(),
    })?;
    let mut archive =
        ZipArchive::new(BufReader::new(file)).map_err(|e| ArchiveError::OpenFailed {
            path: archive_display.clone(),
            reason: e.to_string(),
        })?;

    if archive.is_empty() {
        return Err(ArchiveError::NoEntries(archive_display));
    }

    let mut entry = archive.by_index(0).map_err(|e| ArchiveError::OpenFailed {
        path: archive_display.clone(),
        reason: e.to_string(),
    })?;
    let entry_name = entry.name().to_string();
    let entry_size = entry.size();
    let expected_crc = entry.crc32();

    if let Some(available) = available_bytes {
        if entry_size > available {
            return Err(ArchiveError::InsufficientDiskSpace {
                dest: dest_display,
                entry: entry_name,
                available: format_bytes(available),
                needed: format_bytes(entry_size),
            });
        }
    }

    let mut partial = PartialFile {
        path: dest_path.to_path_buf(),
        keep: false,
    };
    let mut dst = File::create(dest_path).map_err(|e| ArchiveError::WriteFailed {
        path: dest_display.clone(),
        reason: e.to_string(),
    })?;

    debug!(
        archive = %archive_display,
        entry = %entry_name,
        size = entry_size,
        "Extracting first archive entry"
    );

    on_progress(0);

    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut written: u64 = 0;

    while written < entry_size {
        if is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }

        let n = match entry.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(ArchiveError::ReadFailed {
                    path: archive_display,
                    entry: entry_name,
                    reason: e.to_string(),
                })
            }
        };

        hasher.update(&buf[..n]);
        dst.write_all(&buf[..n])
            .map_err(|e| ArchiveError::WriteFailed {
                path: dest_display.clone(),
                reason: e.to_string(),
            })?;
        written += n as u64;

        on_progress(percent(written, entry_size));
    }

    dst.flush().map_err(|e| ArchiveError::WriteFailed {
        path: dest_display.clone(),
        reason: e.to_string(),
    })?;
    drop(dst);

    if written < entry_size {
        return Err(ArchiveError::TruncatedEntry {
            path: archive_display,
            entry: entry_name,
        });
    }

    let actual_crc = hasher.finalize();
    if actual_crc != expected_crc {
        return Err(ArchiveError::ChecksumMismatch {
            path: archive_display,
            entry: entry_name,
            expected: expected_crc,
            actual: actual_crc,
        });
    }

    partial.keep = true;
    Ok(ExtractedEntry {
        name: entry_name,
        size: entry_size,
        crc32: actual_crc,
    })
}

fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done as f64 / total as f64) * 100.0).min(100.0) as u8
}
