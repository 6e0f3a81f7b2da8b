//! Store client seam.
//!
//! The harness talks to the data store only through [`StoreClient`]. A client
//! owns session establishment, the host list, keyspace selection, per-call
//! timeouts and pool sizing; callers share one instance behind an `Arc` and
//! issue statements concurrently.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

mod memory;
mod postgres;
mod statement;

pub use memory::{MemoryStore, MemoryStoreOptions, MemoryStoreStats};
pub use postgres::PostgresStore;
pub use statement::{ColumnType, Dialect, Statement, StatementShape, RECORD_COLUMNS};

/// Typed bind argument or result cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Uuid(Uuid),
    Text(String),
    Bool(bool),
    BigInt(i64),
    Timestamp(DateTime<Utc>),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Self::Uuid(_) => "uuid",
            Self::Text(_) => "text",
            Self::Bool(_) => "bool",
            Self::BigInt(_) => "bigint",
            Self::Timestamp(_) => "timestamp",
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::BigInt(value)
    }
}

impl From<Uuid> for Value {
    fn from(value: Uuid) -> Self {
        Self::Uuid(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

/// One result row, cells in projection order.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }
}

/// Failure of a single store call.
///
/// Every variant is a transient fault from the harness's point of view: the
/// enclosing task records it and keeps going.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{statement} timed out after {timeout:?}")]
    Timeout {
        statement: Statement,
        timeout: Duration,
    },
    #[error("{statement} failed: {message}")]
    Io { statement: Statement, message: String },
    #[error("{statement}: bad argument at position {index}: {reason}")]
    Bind {
        statement: Statement,
        index: usize,
        reason: String,
    },
    #[error("{statement}: unexpected result shape: {reason}")]
    Shape { statement: Statement, reason: String },
}

impl StoreError {
    pub fn statement(&self) -> Statement {
        match self {
            Self::Timeout { statement, .. }
            | Self::Io { statement, .. }
            | Self::Bind { statement, .. }
            | Self::Shape { statement, .. } => *statement,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Operations the harness needs from a data store.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Dialect used to render statements.
    fn dialect(&self) -> Dialect;

    /// Run a write statement.
    async fn execute(&self, statement: Statement, args: &[Value]) -> Result<(), StoreError>;

    /// Run a count-style statement and return its single value.
    async fn query_scalar(&self, statement: Statement, args: &[Value]) -> Result<i64, StoreError>;

    /// Run a row-returning statement.
    async fn query_rows(
        &self,
        statement: Statement,
        args: &[Value],
    ) -> Result<Vec<Row>, StoreError>;
}

/// Which store implementation to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// PostgreSQL-wire server (tables `test` and `test_by_created_at`).
    Postgres,
    /// In-process store with an asynchronously maintained view.
    Memory,
}

/// Session parameters owned by the store client.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub backend: Backend,
    pub hosts: Vec<String>,
    pub port: u16,
    pub keyspace: String,
    pub user: String,
    pub password: Option<String>,
    /// Number of pooled connections.
    pub connections: usize,
    /// Upper bound for one store call, including connection acquisition.
    pub op_timeout: Duration,
    pub memory: MemoryStoreOptions,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Postgres,
            hosts: vec!["localhost".to_string()],
            port: 5432,
            keyspace: "test".to_string(),
            user: "postgres".to_string(),
            password: None,
            connections: 50,
            op_timeout: Duration::from_secs(60),
            memory: MemoryStoreOptions::default(),
        }
    }
}

/// Split a comma-separated host list, dropping empty entries.
pub fn parse_hosts(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Establish a session for the configured backend.
///
/// A failure here is a configuration fault; callers should abort the run
/// instead of retrying per call.
pub async fn connect(config: &SessionConfig) -> anyhow::Result<Arc<dyn StoreClient>> {
    match config.backend {
        Backend::Postgres => {
            let store = PostgresStore::connect(config)
                .await
                .context("establish postgres session")?;
            Ok(Arc::new(store))
        }
        Backend::Memory => {
            let mut options = config.memory.clone();
            options.op_timeout = config.op_timeout;
            Ok(Arc::new(MemoryStore::new(options)))
        }
    }
}

/// Positional argument accessors with typed bind errors.
pub(crate) struct Args<'a> {
    statement: Statement,
    values: &'a [Value],
}

impl<'a> Args<'a> {
    pub(crate) fn new(statement: Statement, values: &'a [Value]) -> Result<Self, StoreError> {
        if values.len() != statement.arity() {
            return Err(StoreError::Bind {
                statement,
                index: values.len(),
                reason: format!("expected {} arguments, got {}", statement.arity(), values.len()),
            });
        }
        Ok(Self { statement, values })
    }

    fn mismatch(&self, index: usize, expected: &str) -> StoreError {
        let got = self
            .values
            .get(index)
            .map(Value::type_name)
            .unwrap_or("nothing");
        StoreError::Bind {
            statement: self.statement,
            index,
            reason: format!("expected {expected}, got {got}"),
        }
    }

    pub(crate) fn text(&self, index: usize) -> Result<&'a str, StoreError> {
        match self.values.get(index) {
            Some(Value::Text(v)) => Ok(v.as_str()),
            _ => Err(self.mismatch(index, "text")),
        }
    }

    pub(crate) fn boolean(&self, index: usize) -> Result<bool, StoreError> {
        match self.values.get(index) {
            Some(Value::Bool(v)) => Ok(*v),
            _ => Err(self.mismatch(index, "bool")),
        }
    }

    pub(crate) fn uuid(&self, index: usize) -> Result<Uuid, StoreError> {
        match self.values.get(index) {
            Some(Value::Uuid(v)) => Ok(*v),
            _ => Err(self.mismatch(index, "uuid")),
        }
    }

    pub(crate) fn timestamp(&self, index: usize) -> Result<DateTime<Utc>, StoreError> {
        match self.values.get(index) {
            Some(Value::Timestamp(v)) => Ok(*v),
            _ => Err(self.mismatch(index, "timestamp")),
        }
    }

    pub(crate) fn bigint(&self, index: usize) -> Result<i64, StoreError> {
        match self.values.get(index) {
            Some(Value::BigInt(v)) => Ok(*v),
            _ => Err(self.mismatch(index, "bigint")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_hosts, Args, Statement, StoreError, Value};

    #[test]
    fn host_list_ignores_blanks() {
        assert_eq!(
            parse_hosts(" db1, ,db2,"),
            vec!["db1".to_string(), "db2".to_string()]
        );
        assert!(parse_hosts("").is_empty());
    }

    #[test]
    fn args_reject_wrong_arity_and_type() {
        let err = Args::new(Statement::CountPrimary, &[]).err().expect("arity error");
        assert!(matches!(err, StoreError::Bind { index: 0, .. }));
        assert_eq!(err.statement(), Statement::CountPrimary);
        assert!(!err.is_timeout());

        let values = [Value::Bool(true)];
        let args = Args::new(Statement::CountPrimary, &values).expect("arity ok");
        let err = args.text(0).expect_err("type error");
        assert!(err.to_string().contains("expected text, got bool"));
    }
}
