//! PostgreSQL-wire backend.
//!
//! Holds a fixed pool of `tokio_postgres` sessions and hands them out
//! round-robin. A `tokio_postgres::Client` pipelines concurrent requests, so
//! sharing one session between tasks is safe; the pool only spreads load.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    ColumnType, Dialect, Row, SessionConfig, Statement, StatementShape, StoreClient, StoreError,
    Value, RECORD_COLUMNS,
};

pub struct PostgresStore {
    clients: Vec<Client>,
    next: AtomicUsize,
    op_timeout: Duration,
    connections: Vec<tokio::task::JoinHandle<()>>,
}

impl PostgresStore {
    /// Open `config.connections` sessions against the configured hosts.
    ///
    /// Fails on the first session that cannot be established.
    pub async fn connect(config: &SessionConfig) -> anyhow::Result<Self> {
        anyhow::ensure!(!config.hosts.is_empty(), "host list must not be empty");
        let mut pg = tokio_postgres::Config::new();
        for host in &config.hosts {
            pg.host(host);
        }
        pg.port(config.port)
            .dbname(&config.keyspace)
            .user(&config.user)
            .connect_timeout(config.op_timeout);
        if let Some(password) = &config.password {
            pg.password(password);
        }

        let pool_size = config.connections.max(1);
        let mut clients = Vec::with_capacity(pool_size);
        let mut connections = Vec::with_capacity(pool_size);
        for idx in 0..pool_size {
            let (client, connection) = pg
                .connect(NoTls)
                .await
                .with_context(|| format!("open session {idx} to {:?}", config.hosts))?;
            connections.push(tokio::spawn(async move {
                if let Err(err) = connection.await {
                    warn!(error = %err, session = idx, "postgres session closed with error");
                }
            }));
            clients.push(client);
        }
        info!(
            hosts = ?config.hosts,
            database = %config.keyspace,
            sessions = pool_size,
            "postgres sessions established"
        );

        Ok(Self {
            clients,
            next: AtomicUsize::new(0),
            op_timeout: config.op_timeout,
            connections,
        })
    }

    fn client(&self) -> &Client {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        &self.clients[idx]
    }

    fn check(
        &self,
        statement: Statement,
        shape: StatementShape,
        args: &[Value],
    ) -> Result<(), StoreError> {
        if statement.shape() != shape {
            return Err(StoreError::Shape {
                statement,
                reason: format!("{:?} statement used as {:?}", statement.shape(), shape),
            });
        }
        if args.len() != statement.arity() {
            return Err(StoreError::Bind {
                statement,
                index: args.len(),
                reason: format!("expected {} arguments, got {}", statement.arity(), args.len()),
            });
        }
        Ok(())
    }

    async fn with_timeout<T, F>(&self, statement: Statement, fut: F) -> Result<T, StoreError>
    where
        F: std::future::Future<Output = Result<T, tokio_postgres::Error>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(StoreError::Io {
                statement,
                message: err.to_string(),
            }),
            Err(_) => Err(StoreError::Timeout {
                statement,
                timeout: self.op_timeout,
            }),
        }
    }
}

impl Drop for PostgresStore {
    fn drop(&mut self) {
        for connection in &self.connections {
            connection.abort();
        }
    }
}

#[async_trait]
impl StoreClient for PostgresStore {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn execute(&self, statement: Statement, args: &[Value]) -> Result<(), StoreError> {
        self.check(statement, StatementShape::Write, args)?;
        let params = bind(args);
        let affected = self
            .with_timeout(
                statement,
                self.client().execute(statement.text(self.dialect()), &params),
            )
            .await?;
        debug!(%statement, affected, "executed");
        Ok(())
    }

    async fn query_scalar(&self, statement: Statement, args: &[Value]) -> Result<i64, StoreError> {
        self.check(statement, StatementShape::Scalar, args)?;
        let params = bind(args);
        let row = self
            .with_timeout(
                statement,
                self.client().query_one(statement.text(self.dialect()), &params),
            )
            .await?;
        row.try_get::<_, i64>(0).map_err(|err| StoreError::Shape {
            statement,
            reason: err.to_string(),
        })
    }

    async fn query_rows(
        &self,
        statement: Statement,
        args: &[Value],
    ) -> Result<Vec<Row>, StoreError> {
        self.check(statement, StatementShape::Rows, args)?;
        let params = bind(args);
        let rows = self
            .with_timeout(
                statement,
                self.client().query(statement.text(self.dialect()), &params),
            )
            .await?;
        rows.iter().map(|row| decode(statement, row)).collect()
    }
}

fn bind(args: &[Value]) -> Vec<&(dyn ToSql + Sync)> {
    args.iter()
        .map(|value| match value {
            Value::Uuid(v) => v as &(dyn ToSql + Sync),
            Value::Text(v) => v as &(dyn ToSql + Sync),
            Value::Bool(v) => v as &(dyn ToSql + Sync),
            Value::BigInt(v) => v as &(dyn ToSql + Sync),
            Value::Timestamp(v) => v as &(dyn ToSql + Sync),
        })
        .collect()
}

fn decode(statement: Statement, row: &tokio_postgres::Row) -> Result<Row, StoreError> {
    if row.len() != RECORD_COLUMNS.len() {
        return Err(StoreError::Shape {
            statement,
            reason: format!("expected {} columns, got {}", RECORD_COLUMNS.len(), row.len()),
        });
    }
    let shape = |err: tokio_postgres::Error| StoreError::Shape {
        statement,
        reason: err.to_string(),
    };
    let mut values = Vec::with_capacity(RECORD_COLUMNS.len());
    for (idx, column) in RECORD_COLUMNS.iter().enumerate() {
        let value = match column {
            ColumnType::Uuid => Value::Uuid(row.try_get::<_, Uuid>(idx).map_err(shape)?),
            ColumnType::Text => Value::Text(row.try_get::<_, String>(idx).map_err(shape)?),
            ColumnType::Bool => Value::Bool(row.try_get::<_, bool>(idx).map_err(shape)?),
            ColumnType::Timestamp => {
                Value::Timestamp(row.try_get::<_, DateTime<Utc>>(idx).map_err(shape)?)
            }
        };
        values.push(value);
    }
    Ok(Row::new(values))
}
