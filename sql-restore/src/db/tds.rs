//! Production driver: SQL Server over TDS using `tiberius`.

use async_trait::async_trait;
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel, SqlBrowser};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::debug;

use super::{ConnectParams, Row, SqlDriver, SqlError, SqlSession, SqlValue};

const APPLICATION_NAME: &str = "sql-restore";

/// Where to reach the server, parsed from `host`, `host,port` or
/// `host\instance` (an optional `tcp:` prefix is accepted).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    pub host: String,
    pub port: Option<u16>,
    pub instance: Option<String>,
}

impl ServerAddress {
    pub fn parse(server: &str) -> Result<Self, SqlError> {
        let server = server.trim();
        let server = server.strip_prefix("tcp:").unwrap_or(server);

        if let Some((host, port)) = server.split_once(',') {
            let port = port
                .trim()
                .parse::<u16>()
                .map_err(|_| SqlError(format!("Invalid port in server address '{}'", server)))?;
            return Ok(Self {
                host: host.trim().to_string(),
                port: Some(port),
                instance: None,
            });
        }

        match server.split_once('\\') {
            Some((host, instance)) if !instance.is_empty() => Ok(Self {
                host: host.to_string(),
                port: None,
                instance: Some(instance.to_string()),
            }),
            _ => Ok(Self {
                host: server.trim_end_matches('\\').to_string(),
                port: None,
                instance: None,
            }),
        }
    }

    fn host(&self) -> &str {
        // "." and "(local)" are the usual aliases for the local machine.
        match self.host.as_str() {
            "" | "." | "(local)" => "localhost",
            host => host,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TdsDriver;

impl TdsDriver {
    fn config(params: &ConnectParams) -> Result<Config, SqlError> {
        let address = ServerAddress::parse(&params.server)?;
        let mut config = Config::new();
        config.host(address.host());
        if let Some(port) = address.port {
            config.port(port);
        }
        if let Some(instance) = &address.instance {
            config.instance_name(instance);
        }
        config.application_name(APPLICATION_NAME);
        config.encryption(EncryptionLevel::NotSupported);
        config.trust_cert();
        config.authentication(Self::auth(params)?);
        Ok(config)
    }

    #[cfg(windows)]
    fn auth(params: &ConnectParams) -> Result<AuthMethod, SqlError> {
        if params.trusted_connection {
            return Ok(AuthMethod::Integrated);
        }
        Ok(AuthMethod::sql_server(&params.username, &params.password))
    }

    #[cfg(not(windows))]
    fn auth(params: &ConnectParams) -> Result<AuthMethod, SqlError> {
        if params.trusted_connection {
            return Err(SqlError(
                "Trusted connections are only supported on Windows".to_string(),
            ));
        }
        Ok(AuthMethod::sql_server(&params.username, &params.password))
    }
}

#[async_trait]
impl SqlDriver for TdsDriver {
    async fn open(&self, params: &ConnectParams) -> Result<Box<dyn SqlSession>, SqlError> {
        let config = Self::config(params)?;
        debug!(addr = %config.get_addr(), "Opening TDS connection");

        let tcp = TcpStream::connect_named(&config).await.map_err(sql_error)?;
        tcp.set_nodelay(true)
            .map_err(|e| SqlError(format!("Failed to configure socket: {}", e)))?;

        let client = Client::connect(config, tcp.compat_write())
            .await
            .map_err(sql_error)?;
        Ok(Box::new(TdsSession { client }))
    }
}

struct TdsSession {
    client: Client<Compat<TcpStream>>,
}

impl TdsSession {
    async fn run(&mut self, sql: &str) -> Result<Vec<Vec<tiberius::Row>>, SqlError> {
        self.client
            .simple_query(sql)
            .await
            .map_err(sql_error)?
            .into_results()
            .await
            .map_err(sql_error)
    }
}

#[async_trait]
impl SqlSession for TdsSession {
    async fn query(&mut self, sql: &str) -> Result<Vec<Row>, SqlError> {
        let first = self.run(sql).await?.into_iter().next().unwrap_or_default();
        Ok(first.into_iter().map(convert_row).collect())
    }

    async fn execute(&mut self, sql: &str) -> Result<(), SqlError> {
        // Draining every result set lets RESTORE run to completion.
        self.run(sql).await.map(|_| ())
    }
}

fn sql_error(err: tiberius::error::Error) -> SqlError {
    match err {
        tiberius::error::Error::Server(token) => SqlError(token.message().to_string()),
        other => SqlError(other.to_string()),
    }
}

fn convert_row(row: tiberius::Row) -> Row {
    let columns = row.columns().iter().map(|c| c.name().to_string()).collect();
    let values = row.into_iter().map(convert_value).collect();
    Row::new(columns, values)
}

fn convert_value(data: ColumnData<'static>) -> SqlValue {
    match data {
        ColumnData::U8(Some(v)) => SqlValue::Int(v.into()),
        ColumnData::I16(Some(v)) => SqlValue::Int(v.into()),
        ColumnData::I32(Some(v)) => SqlValue::Int(v.into()),
        ColumnData::I64(Some(v)) => SqlValue::Int(v),
        ColumnData::F32(Some(v)) => SqlValue::Float(v.into()),
        ColumnData::F64(Some(v)) => SqlValue::Float(v),
        ColumnData::Bit(Some(v)) => SqlValue::Bool(v),
        ColumnData::String(Some(v)) => SqlValue::Text(v.into_owned()),
        ColumnData::Guid(Some(v)) => SqlValue::Text(v.to_string()),
        // Dates, binaries and decimals are never read by the restore protocol.
        _ => SqlValue::Null,
    }
}
