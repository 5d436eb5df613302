//! Scripted in-memory SQL server for tests.
//!
//! Responses are matched by statement prefix, the latest rule wins. Every
//! statement that reaches a session is recorded in order.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{ConnectParams, Row, SqlDriver, SqlError, SqlSession, SqlValue};

type Hook = Arc<dyn Fn() + Send + Sync>;

enum Reply {
    Rows(Vec<Row>),
    Fail(String),
}

struct Rule {
    prefix: String,
    reply: Reply,
}

#[derive(Default)]
struct State {
    rules: Vec<Rule>,
    hooks: Vec<(String, Hook)>,
    statements: Vec<String>,
    opens: usize,
    refuse: Option<String>,
    login_delay: Option<Duration>,
}

#[derive(Clone, Default)]
pub struct FakeServer {
    state: Arc<Mutex<State>>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer statements starting with `prefix` with `rows`.
    pub fn respond(&self, prefix: &str, rows: Vec<Row>) -> &Self {
        self.state.lock().unwrap().rules.push(Rule {
            prefix: prefix.to_string(),
            reply: Reply::Rows(rows),
        });
        self
    }

    /// Fail statements starting with `prefix` with `message`.
    pub fn fail(&self, prefix: &str, message: &str) -> &Self {
        self.state.lock().unwrap().rules.push(Rule {
            prefix: prefix.to_string(),
            reply: Reply::Fail(message.to_string()),
        });
        self
    }

    /// Run `hook` whenever a statement starting with `prefix` arrives.
    pub fn on_statement<F>(&self, prefix: &str, hook: F) -> &Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.state
            .lock()
            .unwrap()
            .hooks
            .push((prefix.to_string(), Arc::new(hook)));
        self
    }

    pub fn refuse_logins(&self, message: &str) {
        self.state.lock().unwrap().refuse = Some(message.to_string());
    }

    pub fn delay_logins(&self, delay: Duration) {
        self.state.lock().unwrap().login_delay = Some(delay);
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().unwrap().opens
    }

    pub fn statements(&self) -> Vec<String> {
        self.state.lock().unwrap().statements.clone()
    }

    pub fn statements_starting_with(&self, prefix: &str) -> Vec<String> {
        self.statements()
            .into_iter()
            .filter(|s| s.starts_with(prefix))
            .collect()
    }

    fn run(&self, sql: &str) -> Result<Vec<Row>, SqlError> {
        let hooks: Vec<Hook> = {
            let mut state = self.state.lock().unwrap();
            state.statements.push(sql.to_string());
            state
                .hooks
                .iter()
                .filter(|(prefix, _)| sql.starts_with(prefix.as_str()))
                .map(|(_, hook)| Arc::clone(hook))
                .collect()
        };
        for hook in hooks {
            hook();
        }

        let state = self.state.lock().unwrap();
        match state.rules.iter().rev().find(|r| sql.starts_with(r.prefix.as_str())) {
            Some(Rule { reply: Reply::Rows(rows), .. }) => Ok(rows.clone()),
            Some(Rule { reply: Reply::Fail(message), .. }) => Err(SqlError(message.clone())),
            None => Ok(Vec::new()),
        }
    }

    /// Script a healthy server with one backup set per `(position, name, version)`.
    pub fn with_backup(server_version: &str, sets: &[(i64, &str, i64)]) -> Self {
        let server = FakeServer::new();
        server.respond(
            "SELECT CAST(SERVERPROPERTY('ProductVersion')",
            vec![Row::from_pairs([(
                "ProductVersion",
                SqlValue::Text(server_version.to_string()),
            )])],
        );
        server.respond(
            "RESTORE HEADERONLY",
            sets.iter()
                .map(|(position, name, version)| header_row(1, *position, name, *version))
                .collect(),
        );
        server.respond(
            "SELECT d.name AS DatabaseName",
            vec![
                master_file_row(r"C:\SQL\DATA\master.mdf", "ROWS"),
                master_file_row(r"C:\SQL\LOG\mastlog.ldf", "LOG"),
            ],
        );
        server
    }
}

pub fn header_row(backup_type: i64, position: i64, name: &str, version: i64) -> Row {
    Row::from_pairs([
        ("BackupType", SqlValue::Int(backup_type)),
        ("Position", SqlValue::Int(position)),
        ("DatabaseName", SqlValue::Text(name.to_string())),
        ("SoftwareVersionMajor", SqlValue::Int(version)),
    ])
}

pub fn master_file_row(physical_name: &str, type_of_file: &str) -> Row {
    Row::from_pairs([
        ("DatabaseName", SqlValue::Text("master".to_string())),
        ("PhysicalName", SqlValue::Text(physical_name.to_string())),
        ("TypeofFile", SqlValue::Text(type_of_file.to_string())),
    ])
}

pub fn file_list_row(logical_name: &str, file_type: &str) -> Row {
    Row::from_pairs([
        ("LogicalName", SqlValue::Text(logical_name.to_string())),
        ("Type", SqlValue::Text(file_type.to_string())),
    ])
}

pub fn database_row(name: &str, state: &str) -> Row {
    Row::from_pairs([
        ("name", SqlValue::Text(name.to_string())),
        ("state_desc", SqlValue::Text(state.to_string())),
    ])
}

pub struct FakeDriver {
    server: FakeServer,
}

impl FakeDriver {
    pub fn new(server: FakeServer) -> Self {
        Self { server }
    }
}

#[async_trait]
impl SqlDriver for FakeDriver {
    async fn open(&self, _params: &ConnectParams) -> Result<Box<dyn SqlSession>, SqlError> {
        let (refuse, delay) = {
            let mut state = self.server.state.lock().unwrap();
            state.opens += 1;
            (state.refuse.clone(), state.login_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = refuse {
            return Err(SqlError(message));
        }
        Ok(Box::new(FakeSession {
            server: self.server.clone(),
        }))
    }
}

struct FakeSession {
    server: FakeServer,
}

#[async_trait]
impl SqlSession for FakeSession {
    async fn query(&mut self, sql: &str) -> Result<Vec<Row>, SqlError> {
        self.server.run(sql)
    }

    async fn execute(&mut self, sql: &str) -> Result<(), SqlError> {
        self.server.run(sql).map(|_| ())
    }
}
