//! Per-thread connection management.
//!
//! A connector owns at most one open session per calling thread. Repeated
//! `connect` calls from the same thread reuse the session as long as the
//! connection string is unchanged. All connect/close calls on one connector
//! are serialized by a mutex owned by that connector only, so independent
//! connectors (the restore worker and a settings check, say) never contend.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::ThreadId;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info};
use uuid::Uuid;

use super::{ConnectParams, SqlDriver, SqlError, SqlSession};
use crate::events::EventBus;

/// Shared handle to an open session.
pub type SessionHandle = Arc<Mutex<Box<dyn SqlSession>>>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectorError {
    #[error("Missing SQL server settings")]
    MissingParameters,

    #[error("{0}")]
    Connect(String),
}

/// Connection lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum ConnectorEvent {
    #[serde(rename = "db:connecting")]
    Connecting { odbc_driver: String, server: String },

    #[serde(rename = "db:connected")]
    Connected { odbc_driver: String, server: String },

    #[serde(rename = "db:failed")]
    Failed(String),

    #[serde(rename = "db:closed")]
    Closed,
}

struct OpenConnection {
    connection_string: String,
    session: SessionHandle,
}

pub struct DbConnector {
    id: Uuid,
    driver: Arc<dyn SqlDriver>,
    connections: Mutex<HashMap<ThreadId, OpenConnection>>,
    events: EventBus<ConnectorEvent>,
}

impl DbConnector {
    pub fn new(driver: Arc<dyn SqlDriver>) -> Self {
        Self {
            id: Uuid::new_v4(),
            driver,
            connections: Mutex::new(HashMap::new()),
            events: EventBus::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectorEvent> {
        self.events.subscribe()
    }

    /// Open (or reuse) the session registered for the calling thread.
    pub async fn connect(&self, params: &ConnectParams) -> Result<SessionHandle, ConnectorError> {
        self.connect_inner(params, false)
            .await?
            .ok_or_else(|| ConnectorError::Connect("Connection was not retained".to_string()))
    }

    /// Check that `params` can log in, without keeping a new session around.
    pub async fn test_connection(&self, params: &ConnectParams) -> Result<(), ConnectorError> {
        self.connect_inner(params, true).await.map(|_| ())
    }

    /// Close the calling thread's session, if any.
    pub async fn close(&self) {
        let mut connections = self.connections.lock().await;
        let key = std::thread::current().id();
        if connections.remove(&key).is_some() {
            debug!(connection = %self.identity(key), "Closed database connection");
            self.events.emit(ConnectorEvent::Closed);
        }
    }

    /// Number of sessions currently held by this connector.
    pub async fn open_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    async fn connect_inner(
        &self,
        params: &ConnectParams,
        test_only: bool,
    ) -> Result<Option<SessionHandle>, ConnectorError> {
        if !params.is_complete() {
            let err = ConnectorError::MissingParameters;
            error!("{}", err);
            self.events.emit(ConnectorEvent::Failed(err.to_string()));
            return Err(err);
        }

        let mut connections = self.connections.lock().await;
        let key = std::thread::current().id();
        let connection_string = params.connection_string();

        if let Some(existing) = connections.get(&key) {
            if existing.connection_string == connection_string {
                self.emit_connected(params);
                return Ok(Some(Arc::clone(&existing.session)));
            }
        }
        // Settings changed since the session was opened.
        if connections.remove(&key).is_some() {
            debug!(connection = %self.identity(key), "Connection string changed, closed previous connection");
        }

        debug!(
            connection = %self.identity(key),
            server = %params.server,
            odbc_driver = %params.odbc_driver,
            trusted = params.trusted_connection,
            "Connecting"
        );
        self.events.emit(ConnectorEvent::Connecting {
            odbc_driver: params.odbc_driver.clone(),
            server: params.server.clone(),
        });

        let session = match self.open(params).await {
            Ok(session) => session,
            Err(e) => {
                error!(server = %params.server, error = %e, "Connection failed");
                self.events.emit(ConnectorEvent::Failed(e.to_string()));
                return Err(ConnectorError::Connect(e.to_string()));
            }
        };

        info!(server = %params.server, "Connected");
        self.emit_connected(params);

        if test_only {
            drop(session);
            return Ok(None);
        }

        let session: SessionHandle = Arc::new(Mutex::new(session));
        connections.insert(
            key,
            OpenConnection {
                connection_string,
                session: Arc::clone(&session),
            },
        );
        Ok(Some(session))
    }

    async fn open(&self, params: &ConnectParams) -> Result<Box<dyn SqlSession>, SqlError> {
        match params.login_timeout() {
            Some(limit) => tokio::time::timeout(limit, self.driver.open(params))
                .await
                .map_err(|_| {
                    SqlError(format!(
                        "Login timeout expired after {} seconds",
                        limit.as_secs()
                    ))
                })?,
            None => self.driver.open(params).await,
        }
    }

    fn emit_connected(&self, params: &ConnectParams) {
        self.events.emit(ConnectorEvent::Connected {
            odbc_driver: params.odbc_driver.clone(),
            server: params.server.clone(),
        });
    }

    fn identity(&self, key: ThreadId) -> String {
        format!("{}_thread_{:?}", self.id, key)
    }
}
