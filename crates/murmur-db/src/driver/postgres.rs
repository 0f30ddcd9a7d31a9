//! PostgreSQL storage backend.
//!
//! Uses the simple-query protocol throughout. Positional `$n` parameters
//! are bound client-side with literal escaping before the statement is
//! sent; this keeps the whole result path textual (matching [`Rows`]) and
//! sidesteps extended-protocol type inference for parameters that always
//! arrive as strings. Prepared statements are emulated the same way: the
//! SQL is kept client-side and bound per execution.

use std::collections::HashMap;

use async_trait::async_trait;
use murmur_error::StoreError;
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};
use tracing::{debug, error};

use super::{Rows, StorageConnection, StorageDriver};
use crate::conninfo::ConnectionInfo;

/// Driver producing connections to a PostgreSQL server.
#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresDriver;

impl PostgresDriver {
    /// Create the driver.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StorageDriver for PostgresDriver {
    async fn connect(&self, info: &ConnectionInfo) -> Result<Box<dyn StorageConnection>, StoreError> {
        debug!(server = %info, "opening postgres connection");

        let (client, connection) = tokio_postgres::connect(&info.to_backend_string(), NoTls)
            .await
            .map_err(|e| StoreError::Storage {
                message: format!("connect failed: {e}"),
                source:  Some(Box::new(e)),
            })?;

        // The connection future drives the socket; it lives until the
        // client is dropped.
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "postgres connection task ended with error");
            }
        });

        Ok(Box::new(PostgresConnection {
            client,
            prepared: HashMap::new(),
            in_txn: false,
        }))
    }
}

struct PostgresConnection {
    client: Client,
    prepared: HashMap<String, String>,
    in_txn: bool,
}

impl PostgresConnection {
    async fn run(&mut self, sql: &str) -> Result<Rows, StoreError> {
        let messages = self
            .client
            .simple_query(sql)
            .await
            .map_err(|e| StoreError::Storage {
                message: format!("query failed: {e}"),
                source:  Some(Box::new(e)),
            })?;

        let mut columns: Vec<String> = Vec::new();
        let mut rows: Vec<Vec<Option<String>>> = Vec::new();
        let mut rows_affected = 0u64;

        for message in messages {
            match message {
                SimpleQueryMessage::Row(row) => {
                    if columns.is_empty() {
                        columns = row.columns().iter().map(|c| c.name().to_string()).collect();
                    }
                    let values = (0..row.len())
                        .map(|i| row.get(i).map(str::to_string))
                        .collect();
                    rows.push(values);
                },
                SimpleQueryMessage::CommandComplete(count) => rows_affected = count,
                _ => {},
            }
        }

        Ok(Rows::new(columns, rows, rows_affected))
    }
}

#[async_trait]
impl StorageConnection for PostgresConnection {
    async fn execute(&mut self, sql: &str, params: &[String]) -> Result<Rows, StoreError> {
        let bound = bind_params(sql, params)?;
        self.run(&bound).await
    }

    async fn prepare(&mut self, name: &str, sql: &str) -> Result<(), StoreError> {
        self.prepared.insert(name.to_string(), sql.to_string());
        Ok(())
    }

    async fn execute_prepared(&mut self, name: &str, params: &[String]) -> Result<Rows, StoreError> {
        let sql = self
            .prepared
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::storage(format!("unknown prepared statement: {name}")))?;
        self.execute(&sql, params).await
    }

    async fn begin(&mut self) -> Result<(), StoreError> {
        if self.in_txn {
            return Err(StoreError::storage("transaction already open"));
        }
        self.run("BEGIN").await?;
        self.in_txn = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        if !self.in_txn {
            return Err(StoreError::storage("no open transaction"));
        }
        self.run("COMMIT").await?;
        self.in_txn = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        if !self.in_txn {
            return Err(StoreError::storage("no open transaction"));
        }
        self.run("ROLLBACK").await?;
        self.in_txn = false;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.in_txn
    }

    async fn is_alive(&self) -> bool {
        !self.client.is_closed() && self.client.simple_query("SELECT 1").await.is_ok()
    }

    async fn close(&mut self) {
        // Dropping the client closes the socket and ends the connection
        // task; nothing explicit to do here.
    }
}

/// Substitute `$1..$n` with escaped literals.
///
/// Replacement scans right-to-left so `$1` never clobbers the prefix of
/// `$10`. Parameters are always bound as quoted strings; the server casts
/// from text where the column type demands it.
fn bind_params(sql: &str, params: &[String]) -> Result<String, StoreError> {
    let mut bound = sql.to_string();
    for (idx, value) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", idx + 1);
        if !bound.contains(&placeholder) {
            return Err(StoreError::storage(format!("statement does not use {placeholder}")));
        }
        bound = bound.replace(&placeholder, &escape_literal(value)?);
    }
    Ok(bound)
}

/// Quote a string literal for inclusion in a simple-protocol statement.
fn escape_literal(value: &str) -> Result<String, StoreError> {
    if value.contains('\0') {
        return Err(StoreError::InvalidInput {
            message: "parameter contains NUL byte".to_string(),
        });
    }
    // Quotes are doubled; values with backslashes go through E'' syntax so
    // they read the same regardless of standard_conforming_strings.
    let escaped = value.replace('\\', "\\\\").replace('\'', "''");
    if escaped.contains('\\') {
        Ok(format!(" E'{escaped}'"))
    } else {
        Ok(format!("'{escaped}'"))
    }
}
