//! T-SQL text for every statement the restore protocol issues.
//!
//! Identifiers are bracket-quoted and string literals are emitted as Unicode
//! literals, so database names and paths are never spliced in raw.

/// `[name]` with `]` doubled.
pub fn quote_ident(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

/// `N'value'` with `'` doubled.
pub fn quote_str(value: &str) -> String {
    format!("N'{}'", value.replace('\'', "''"))
}

pub const SERVER_VERSION: &str =
    "SELECT CAST(SERVERPROPERTY('ProductVersion') AS nvarchar(128)) AS ProductVersion";

pub fn header_only(bakfile: &str) -> String {
    format!("RESTORE HEADERONLY FROM DISK = {}", quote_str(bakfile))
}

pub fn verify_only(bakfile: &str) -> String {
    format!("RESTORE VERIFYONLY FROM DISK = {}", quote_str(bakfile))
}

/// Physical files of the `master` database, used to find the default
/// DATA and LOG directories.
pub fn master_files() -> String {
    format!(
        "SELECT d.name AS DatabaseName, f.physical_name AS PhysicalName, f.type_desc AS TypeofFile \
         FROM sys.master_files f INNER JOIN sys.databases d ON d.database_id = f.database_id \
         WHERE d.name = {}",
        quote_str("master")
    )
}

pub fn file_list_only(bakfile: &str, position: i64) -> String {
    format!(
        "RESTORE FILELISTONLY FROM DISK = {} WITH FILE = {}",
        quote_str(bakfile),
        position
    )
}

pub fn database_state(database: &str) -> String {
    format!(
        "SELECT name, state_desc FROM sys.databases WHERE name = {}",
        quote_str(database)
    )
}

pub fn set_single_user(database: &str) -> String {
    format!(
        "ALTER DATABASE {} SET SINGLE_USER WITH ROLLBACK IMMEDIATE",
        quote_ident(database)
    )
}

pub fn system_files(database: &str) -> String {
    format!("SELECT filename FROM {}..sysfiles", quote_ident(database))
}

/// Arguments of a `RESTORE DATABASE ... WITH MOVE` statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreDatabase<'a> {
    pub database: &'a str,
    pub bakfile: &'a str,
    pub position: i64,
    pub logical_data: &'a str,
    pub data_file: &'a str,
    pub logical_log: &'a str,
    pub log_file: &'a str,
}

impl RestoreDatabase<'_> {
    pub fn to_sql(&self) -> String {
        format!(
            "RESTORE DATABASE {} FROM DISK = {} WITH FILE = {}, MOVE {} TO {}, MOVE {} TO {}, NOUNLOAD, REPLACE",
            quote_ident(self.database),
            quote_str(self.bakfile),
            self.position,
            quote_str(self.logical_data),
            quote_str(self.data_file),
            quote_str(self.logical_log),
            quote_str(self.log_file),
        )
    }
}

pub fn rename_logical_file(database: &str, old_name: &str, new_name: &str) -> String {
    format!(
        "ALTER DATABASE {} MODIFY FILE (NAME = {}, NEWNAME = {})",
        quote_ident(database),
        quote_ident(old_name),
        quote_ident(new_name)
    )
}

pub fn set_multi_user(database: &str) -> String {
    format!("ALTER DATABASE {} SET MULTI_USER", quote_ident(database))
}
