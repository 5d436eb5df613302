//! Path helpers shared by the restore engine.
//!
//! Local paths are handled with `std::path`. Paths on the SQL server side are
//! plain strings because they follow the server's conventions, not ours.

use rand::distributions::Alphanumeric;
use rand::Rng;
use std::path::{Path, PathBuf};

/// Length of the random part of temp and probe file names.
pub const RANDOM_NAME_LEN: usize = 20;

/// Random `[A-Za-z0-9]{20}.tmp` file name.
pub fn random_tmp_name() -> String {
    let stem: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(RANDOM_NAME_LEN)
        .map(char::from)
        .collect();
    format!("{stem}.tmp")
}

pub fn local_file_path(local_path: &Path, filename: &str) -> PathBuf {
    local_path.join(filename)
}

/// Join a file name onto the server-visible backup path, keeping whichever
/// separator style the path already uses.
pub fn remote_file_path(remote_path: &str, filename: &str) -> String {
    let mut ret = remote_path.to_string();
    if !ret.ends_with('/') && !ret.ends_with('\\') {
        if ret.contains('/') {
            ret.push('/');
        } else if ret.contains('\\') {
            ret.push('\\');
        } else {
            ret.push(std::path::MAIN_SEPARATOR);
        }
    }
    ret.push_str(filename);
    ret
}

/// Directory component of a server-side path.
///
/// The last `/` wins; otherwise the last `\`. A separator at index 0 or no
/// separator at all yields `None`.
pub fn parent_dir(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(pos) if pos > 0 => Some(&path[..pos]),
        _ => match path.rfind('\\') {
            Some(pos) if pos > 0 => Some(&path[..pos]),
            _ => None,
        },
    }
}

/// Join a file name onto a server-side directory.
///
/// SQL Server mostly runs on Windows, so `\` is used unless the directory
/// only contains `/` (SQL Server on Linux).
pub fn join_server_path(dir: &str, filename: &str) -> String {
    let sep = if dir.contains('/') && !dir.contains('\\') { '/' } else { '\\' };
    format!("{dir}{sep}{filename}")
}

/// Free space on the volume holding `path`, if it can be determined.
///
/// Network shares frequently report nothing useful; callers treat `None` as
/// "skip the check".
pub fn available_space(path: &Path) -> Option<u64> {
    fs2::available_space(path).ok()
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}
