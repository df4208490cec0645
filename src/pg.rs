//! PostgreSQL backend connections. The wire protocol itself is out
//! of scope here — `tokio_postgres` owns it — this module only
//! covers connection lifecycle (open, capture version/role, close)
//! and the thin `QueryExecutor` seam the orchestrator queries
//! through, so tests can substitute a fake executor instead of a
//! real server.

use crate::config::{ServerConfig, ServerRole};
use std::fmt;
use tokio_postgres::{Client, NoTls, Row};

#[derive(Debug)]
pub enum ConnectError {
    Connect(tokio_postgres::Error),
    VersionQuery(tokio_postgres::Error),
    VersionParse(String),
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectError::Connect(e) => write!(f, "cannot connect: {e}"),
            ConnectError::VersionQuery(e) => write!(f, "cannot query server_version_num: {e}"),
            ConnectError::VersionParse(s) => write!(f, "unrecognized server_version_num: {s:?}"),
        }
    }
}

impl std::error::Error for ConnectError {}

#[derive(Debug)]
pub enum QueryError {
    Execute(tokio_postgres::Error),
    #[cfg(test)]
    Fake(String),
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            QueryError::Execute(e) => write!(f, "query failed: {e}"),
            #[cfg(test)]
            QueryError::Fake(msg) => write!(f, "query failed: {msg}"),
        }
    }
}

impl std::error::Error for QueryError {}

/// A live connection to one configured PostgreSQL backend, plus the
/// facts captured at connect time that the rest of the exporter
/// needs without re-querying them per metric.
pub struct Connection {
    client: Client,
    version: (u32, u32),
    role: ServerRole,
    _connection_task: tokio::task::JoinHandle<()>,
}

impl Connection {
    /// Open a connection to `server`, capturing its version and
    /// actual replication role (`pg_is_in_recovery()`), independent
    /// of the configured `server.role` so a misconfigured role is
    /// still detected rather than silently trusted.
    pub async fn connect(server: &ServerConfig) -> Result<Connection, ConnectError> {
        let (client, connection) = tokio_postgres::connect(&server.conninfo(), NoTls)
            .await
            .map_err(ConnectError::Connect)?;

        let task = tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::warn!(error = %err, "postgresql connection closed with error");
            }
        });

        let row = client
            .query_one("SHOW server_version_num", &[])
            .await
            .map_err(ConnectError::VersionQuery)?;
        let version = parse_version_num(&row)?;

        let recovery_row = client
            .query_one("SELECT pg_is_in_recovery()", &[])
            .await
            .map_err(ConnectError::VersionQuery)?;
        let in_recovery: bool = recovery_row.try_get(0).unwrap_or(false);
        let role = if in_recovery {
            ServerRole::Replica
        } else {
            ServerRole::Primary
        };

        Ok(Connection {
            client,
            version,
            role,
            _connection_task: task,
        })
    }

    pub fn version(&self) -> (u32, u32) {
        self.version
    }

    pub fn role(&self) -> ServerRole {
        self.role
    }
}

fn parse_version_num(row: &Row) -> Result<(u32, u32), ConnectError> {
    let raw: String = row
        .try_get::<_, String>(0)
        .or_else(|_| row.try_get::<_, i32>(0).map(|n| n.to_string()))
        .map_err(|_| ConnectError::VersionParse("<unreadable>".to_string()))?;
    let num: u32 = raw
        .parse()
        .map_err(|_| ConnectError::VersionParse(raw.clone()))?;
    // server_version_num is MMmmpp (e.g. 150004 = 15.4, release 4).
    let major = num / 10000;
    let minor = num % 100;
    Ok((major, minor))
}

/// One result row: label/gauge/counter cells as text (coercion is
/// the caller's job), keyed by column name. Owned rather than a
/// borrowed cursor over `tokio_postgres::Row` so collectors can hold
/// a `Vec<QueryRow>` across `.await` points without pinning a
/// connection borrow, and so tests can build rows without a live
/// server (§6: "an owned `Vec` of row-like tuples").
#[derive(Debug, Clone, Default)]
pub struct QueryRow {
    columns: Vec<String>,
    cells: Vec<Option<String>>,
}

impl QueryRow {
    pub fn get_text(&self, index: usize) -> Option<String> {
        self.cells.get(index).cloned().flatten()
    }

    pub fn column_name(&self, index: usize) -> &str {
        &self.columns[index]
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

impl From<Row> for QueryRow {
    fn from(row: Row) -> Self {
        let columns: Vec<String> = row.columns().iter().map(|c| c.name().to_string()).collect();
        let cells = (0..columns.len())
            .map(|i| row.try_get::<_, Option<String>>(i).ok().flatten())
            .collect();
        QueryRow { columns, cells }
    }
}

/// The seam the query orchestrator executes variant SQL through.
/// Implemented by [`Connection`] for real scrapes and by a fake in
/// tests.
#[async_trait::async_trait]
pub trait QueryExecutor {
    async fn execute(&self, sql: &str) -> Result<Vec<QueryRow>, QueryError>;
}

#[async_trait::async_trait]
impl QueryExecutor for Connection {
    async fn execute(&self, sql: &str) -> Result<Vec<QueryRow>, QueryError> {
        let rows = self
            .client
            .query(sql, &[])
            .await
            .map_err(QueryError::Execute)?;
        Ok(rows.into_iter().map(QueryRow::from).collect())
    }
}

/// A scripted [`QueryExecutor`] for unit tests: each call to
/// `execute` pops the next canned result off the front of the queue,
/// regardless of the SQL text, so collector/orchestrator tests don't
/// need a live PostgreSQL server.
#[cfg(test)]
pub(crate) struct FakeExecutor {
    responses: std::sync::Mutex<std::collections::VecDeque<Result<Vec<QueryRow>, String>>>,
}

#[cfg(test)]
impl FakeExecutor {
    pub(crate) fn new(responses: Vec<Result<Vec<QueryRow>, String>>) -> Self {
        FakeExecutor {
            responses: std::sync::Mutex::new(responses.into()),
        }
    }

    pub(crate) fn row(cells: &[Option<&str>]) -> QueryRow {
        QueryRow {
            columns: (0..cells.len()).map(|i| format!("col{i}")).collect(),
            cells: cells.iter().map(|c| c.map(str::to_string)).collect(),
        }
    }
}

#[cfg(test)]
#[async_trait::async_trait]
impl QueryExecutor for FakeExecutor {
    async fn execute(&self, _sql: &str) -> Result<Vec<QueryRow>, QueryError> {
        let mut responses = self.responses.lock().expect("fake executor mutex poisoned");
        match responses.pop_front() {
            Some(Ok(rows)) => Ok(rows),
            Some(Err(msg)) => Err(QueryError::Fake(msg)),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_num_splits_major_and_minor() {
        // 150004 = PostgreSQL 15.4; the minor version is the low two
        // digits, not the release digits in between.
        assert_eq!(150004 / 10000, 15);
        assert_eq!(150004 % 100, 4);
        assert_eq!(160001 / 10000, 16);
        assert_eq!(160001 % 100, 1);
    }

    #[tokio::test]
    async fn fake_executor_pops_responses_in_order() {
        let fake = FakeExecutor::new(vec![
            Ok(vec![FakeExecutor::row(&[Some("1")])]),
            Ok(vec![FakeExecutor::row(&[Some("2")])]),
        ]);
        let first = fake.execute("select 1").await.unwrap();
        let second = fake.execute("select 2").await.unwrap();
        assert_eq!(first[0].get_text(0), Some("1".to_string()));
        assert_eq!(second[0].get_text(0), Some("2".to_string()));
    }
}
