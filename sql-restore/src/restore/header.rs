//! Backup header inspection and server version compatibility.

use std::collections::BTreeMap;

use crate::db::Row;
use crate::utils::{RestoreError, Result};

/// `BackupType` of a full database backup.
const FULL_DATABASE_BACKUP: i64 = 1;

/// Display name of a SQL Server major version.
pub fn product_name(major: i64) -> &'static str {
    match major {
        9 => "SQL Server 2005",
        10 => "SQL Server 2008",
        11 => "SQL Server 2012",
        12 => "SQL Server 2014",
        13 => "SQL Server 2016",
        14 => "SQL Server 2017",
        15 => "SQL Server 2019",
        16 => "SQL Server 2022",
        _ => "Unknown",
    }
}

/// Major component of a `ProductVersion` string such as `13.0.5026.0`.
/// Anything unparseable is 0.
pub fn parse_major_version(version: &str) -> i64 {
    version
        .trim()
        .split('.')
        .next()
        .and_then(|major| major.trim().parse::<i64>().ok())
        .filter(|major| *major > 0)
        .unwrap_or(0)
}

/// Databases contained in one backup file, keyed by position.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BackupHeader {
    databases: BTreeMap<i64, String>,
    highest_version: i64,
}

impl BackupHeader {
    /// Build the header from `RESTORE HEADERONLY` rows.
    pub fn from_rows(bakfile: &str, rows: &[Row]) -> Result<Self> {
        let mut databases = BTreeMap::new();
        let mut highest_version = 0;
        let mut not_full_backup = false;

        for row in rows.iter().filter(|r| !r.is_empty()) {
            if row.i64("BackupType") != Some(FULL_DATABASE_BACKUP) {
                not_full_backup = true;
            }
            let position = row.i64("Position").unwrap_or(0);
            if databases.contains_key(&position) {
                return Err(RestoreError::Structural(format!(
                    "Backup file \"{}\" contains multiple databases in position {}.",
                    bakfile, position
                )));
            }
            let version = row.i64("SoftwareVersionMajor").unwrap_or(0);
            highest_version = highest_version.max(version);

            match row.text("DatabaseName") {
                Some(name) if !name.is_empty() => {
                    databases.insert(position, name);
                }
                _ => {}
            }
        }

        if not_full_backup {
            return Err(RestoreError::Structural(format!(
                "SQL Backup \"{}\" is not a normal full database backup.",
                bakfile
            )));
        }

        if highest_version <= 0 || databases.is_empty() {
            return Err(RestoreError::Structural(format!(
                "Unable to read SQL Backup \"{}\", it is most likely created on a newer SQL server.",
                bakfile
            )));
        }

        Ok(Self {
            databases,
            highest_version,
        })
    }

    /// `(position, database name)` in position order.
    pub fn databases(&self) -> impl Iterator<Item = (i64, &str)> {
        self.databases.iter().map(|(p, n)| (*p, n.as_str()))
    }

    pub fn len(&self) -> usize {
        self.databases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.databases.is_empty()
    }

    pub fn highest_version(&self) -> i64 {
        self.highest_version
    }

    /// Fail when the backup was taken on a newer server. An unknown server
    /// version (0) never blocks.
    pub fn check_compatible(&self, filename: &str, server_version: i64) -> Result<()> {
        if server_version != 0 && self.highest_version > server_version {
            return Err(RestoreError::VersionIncompatibility(format!(
                "SQL Backup \"{}\" was created on {} ({}), which is newer than this server, this server is {} ({}). You need to upgrade your SQL server.",
                filename,
                product_name(self.highest_version),
                self.highest_version,
                product_name(server_version),
                server_version
            )));
        }
        Ok(())
    }
}
