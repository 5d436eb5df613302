//! SQL Server access.
//!
//! The restore engine talks to the server through the [`SqlSession`] trait so
//! the protocol can be driven against the real TDS client or an in-memory
//! fake. [`connector::DbConnector`] owns the open sessions.

pub mod connector;
pub mod tds;

#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Failure reported by the driver, carrying the server's message text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct SqlError(pub String);

/// A single column value, reduced to what the restore protocol reads.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl SqlValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(v) => Some(*v),
            SqlValue::Float(v) => Some(*v as i64),
            SqlValue::Bool(v) => Some(*v as i64),
            SqlValue::Text(s) => s.trim().parse().ok(),
            SqlValue::Null => None,
        }
    }

    pub fn as_text(&self) -> Option<String> {
        match self {
            SqlValue::Null => None,
            SqlValue::Text(s) => Some(s.clone()),
            SqlValue::Int(v) => Some(v.to_string()),
            SqlValue::Float(v) => Some(v.to_string()),
            SqlValue::Bool(v) => Some(v.to_string()),
        }
    }
}

/// One result row with its column names.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<SqlValue>,
}

impl Row {
    pub fn new(columns: Vec<String>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    /// Build a row from `(column, value)` pairs.
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, SqlValue)>,
        S: Into<String>,
    {
        let (columns, values) = pairs.into_iter().map(|(c, v)| (c.into(), v)).unzip();
        Self { columns, values }
    }

    /// Value of a column, matched case-insensitively.
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
            .and_then(|i| self.values.get(i))
    }

    pub fn get_index(&self, index: usize) -> Option<&SqlValue> {
        self.values.get(index)
    }

    pub fn i64(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(SqlValue::as_i64)
    }

    pub fn text(&self, column: &str) -> Option<String> {
        self.get(column).and_then(SqlValue::as_text)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Parameters for opening a server connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectParams {
    /// Client driver family (kept for the connection identity).
    pub driver: String,
    /// ODBC driver name embedded in the connection string.
    pub odbc_driver: String,
    /// `host`, `host,port` or `host\instance`.
    pub server: String,
    pub trusted_connection: bool,
    pub username: String,
    pub password: String,
    /// Seconds; 0 disables the login timeout.
    pub login_timeout: u64,
}

impl ConnectParams {
    /// Whether every field needed to attempt a connection is present.
    pub fn is_complete(&self) -> bool {
        !self.driver.is_empty()
            && !self.odbc_driver.is_empty()
            && !self.server.is_empty()
            && (self.trusted_connection
                || (!self.username.is_empty() && !self.password.is_empty()))
    }

    /// ODBC-style connection string, also used as the handle identity.
    pub fn connection_string(&self) -> String {
        let mut s = format!("Driver={{{}}};Server={};", self.odbc_driver, self.server);
        if self.trusted_connection {
            s.push_str("Trusted_Connection=Yes;");
        } else {
            s.push_str(&format!("Uid={};Pwd={};", self.username, self.password));
        }
        s.push_str("Encrypt=no;");
        s
    }

    pub fn login_timeout(&self) -> Option<Duration> {
        (self.login_timeout > 0).then(|| Duration::from_secs(self.login_timeout))
    }
}

/// An open connection to the server.
///
/// Statements run strictly one at a time; there is no statement timeout.
#[async_trait]
pub trait SqlSession: Send {
    /// Run a statement and return the rows of its first result set.
    async fn query(&mut self, sql: &str) -> Result<Vec<Row>, SqlError>;

    /// Run a statement, discarding any rows.
    async fn execute(&mut self, sql: &str) -> Result<(), SqlError>;
}

/// Opens sessions for the connector.
#[async_trait]
pub trait SqlDriver: Send + Sync {
    async fn open(&self, params: &ConnectParams) -> Result<Box<dyn SqlSession>, SqlError>;
}
