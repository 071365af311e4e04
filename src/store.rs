//! The transactional surface of the relational store.
//!
//! The pool and the components above it only ever see the two traits here:
//! [`Connector`] opens connections, [`StoreConn`] executes statements on one.
//! Production wires in the sqlx MySQL connector; tests wire in fakes.

use async_trait::async_trait;
use sqlx::mysql::MySqlConnectOptions;
use sqlx::{Connection, MySqlConnection};
use std::time::Duration;
use thiserror::Error;

use crate::config::DatabaseConfig;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("{0}")]
    Other(String),
}

/// One live connection. Statements take positional `?` placeholders with
/// string parameters; DDL that needs identifiers is validated upstream.
#[async_trait]
pub trait StoreConn: Send {
    /// Cheap liveness round-trip, used by the pool before handing out a
    /// connection.
    async fn ping(&mut self) -> Result<(), StoreError>;

    async fn execute(&mut self, sql: &str, params: &[&str]) -> Result<u64, StoreError>;

    async fn begin(&mut self) -> Result<(), StoreError>;
    async fn commit(&mut self) -> Result<(), StoreError>;
    async fn rollback(&mut self) -> Result<(), StoreError>;
}

/// Opens connections for the pool (or, without a schema selected, for
/// server-level DDL like `CREATE DATABASE`).
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: StoreConn + 'static;

    async fn connect(&self) -> Result<Self::Conn, StoreError>;
}

/// Production connector over sqlx MySQL, with a socket-level connect timeout
/// distinct from the pool-acquisition timeout.
#[derive(Debug, Clone)]
pub struct MySqlConnector {
    options: MySqlConnectOptions,
    connect_timeout: Duration,
}

impl MySqlConnector {
    /// Connector bound to the configured schema.
    pub fn from_config(db: &DatabaseConfig) -> Self {
        Self {
            options: Self::base_options(db).database(&db.name),
            connect_timeout: db.connect_timeout,
        }
    }

    /// Server-level connector with no schema selected, for the migration
    /// orchestrator's create-database step.
    pub fn admin(db: &DatabaseConfig) -> Self {
        Self {
            options: Self::base_options(db),
            connect_timeout: db.connect_timeout,
        }
    }

    fn base_options(db: &DatabaseConfig) -> MySqlConnectOptions {
        MySqlConnectOptions::new()
            .host(&db.host)
            .port(db.port)
            .username(&db.user)
            .password(&db.password)
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    type Conn = MySqlStoreConn;

    async fn connect(&self) -> Result<MySqlStoreConn, StoreError> {
        let conn = tokio::time::timeout(
            self.connect_timeout,
            MySqlConnection::connect_with(&self.options),
        )
        .await
        .map_err(|_| StoreError::ConnectTimeout(self.connect_timeout))??;
        Ok(MySqlStoreConn { conn })
    }
}

pub struct MySqlStoreConn {
    conn: MySqlConnection,
}

#[async_trait]
impl StoreConn for MySqlStoreConn {
    async fn ping(&mut self) -> Result<(), StoreError> {
        self.conn.ping().await.map_err(StoreError::from)
    }

    async fn execute(&mut self, sql: &str, params: &[&str]) -> Result<u64, StoreError> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = query.bind(*param);
        }
        let result = query.execute(&mut self.conn).await?;
        Ok(result.rows_affected())
    }

    async fn begin(&mut self) -> Result<(), StoreError> {
        self.execute("START TRANSACTION", &[]).await.map(|_| ())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.execute("COMMIT", &[]).await.map(|_| ())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        // A rollback outside a transaction is a no-op for MySQL, which is
        // exactly what the pool's reset-on-return relies on.
        self.execute("ROLLBACK", &[]).await.map(|_| ())
    }
}
