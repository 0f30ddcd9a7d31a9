//! Connection leases and scoped transactions.
//!
//! The pool never hands out its raw connections: callers get a
//! [`PooledConnection`] lease that returns the connection on drop. The
//! lease exposes the execution surface of the connection plus
//! [`PooledConnection::begin_transaction`], whose guard commits explicitly
//! and rolls back when dropped uncommitted.

use std::sync::Arc;
use std::time::Instant;

use murmur_error::StoreError;

use super::PoolShared;
use crate::driver::{Rows, StorageConnection};

/// Exclusive lease on one pooled connection.
pub struct PooledConnection {
    pub(super) conn: Option<Box<dyn StorageConnection>>,
    pub(super) shared: Arc<PoolShared>,
    pub(super) id: u64,
    pub(super) created: Instant,
    pub(super) pending_rollback: bool,
}

impl PooledConnection {
    /// Run a statement on the leased connection.
    pub async fn execute(&mut self, sql: &str, params: &[String]) -> Result<Rows, StoreError> {
        self.settle_pending_rollback().await?;
        self.conn_mut()?.execute(sql, params).await
    }

    /// Register a named prepared statement on this connection.
    pub async fn prepare(&mut self, name: &str, sql: &str) -> Result<(), StoreError> {
        self.settle_pending_rollback().await?;
        self.conn_mut()?.prepare(name, sql).await
    }

    /// Execute a statement previously prepared on this connection.
    pub async fn execute_prepared(&mut self, name: &str, params: &[String]) -> Result<Rows, StoreError> {
        self.settle_pending_rollback().await?;
        self.conn_mut()?.execute_prepared(name, params).await
    }

    /// Begin a scoped transaction. Fails if one is already open.
    pub async fn begin_transaction(&mut self) -> Result<Transaction<'_>, StoreError> {
        self.settle_pending_rollback().await?;
        self.conn_mut()?.begin().await?;
        Ok(Transaction {
            lease: self,
            completed: false,
        })
    }

    /// Liveness of the underlying connection.
    pub async fn is_alive(&mut self) -> bool {
        match self.conn.as_mut() {
            Some(conn) => conn.is_alive().await,
            None => false,
        }
    }

    /// A transaction guard dropped uncommitted leaves the connection
    /// mid-transaction; roll it back before the connection is used again.
    async fn settle_pending_rollback(&mut self) -> Result<(), StoreError> {
        if self.pending_rollback {
            self.pending_rollback = false;
            self.conn_mut()?.rollback().await?;
        }
        Ok(())
    }

    fn conn_mut(&mut self) -> Result<&mut Box<dyn StorageConnection>, StoreError> {
        self.conn
            .as_mut()
            .ok_or_else(|| StoreError::storage("lease already surrendered"))
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if self.pending_rollback {
            // The rollback is async; finish it off-lease and return the
            // connection afterwards. Outside a runtime the connection is
            // discarded instead of being returned dirty.
            let shared = Arc::clone(&self.shared);
            let (id, created) = (self.id, self.created);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let mut conn = conn;
                    if conn.rollback().await.is_ok() {
                        shared.release(conn, id, created);
                    } else {
                        shared.discard();
                    }
                });
            } else {
                self.shared.discard();
            }
        } else {
            self.shared.release(conn, self.id, self.created);
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("pending_rollback", &self.pending_rollback)
            .finish_non_exhaustive()
    }
}

/// Scoped transaction over a leased connection.
///
/// Begins on construction, commits on [`Transaction::commit`], rolls back
/// when dropped without either. Nested transactions are not supported;
/// beginning one while inside a transaction fails at the driver.
pub struct Transaction<'a> {
    lease: &'a mut PooledConnection,
    completed: bool,
}

impl Transaction<'_> {
    /// Run a statement inside the transaction.
    pub async fn execute(&mut self, sql: &str, params: &[String]) -> Result<Rows, StoreError> {
        self.lease.conn_mut()?.execute(sql, params).await
    }

    /// Commit the transaction.
    pub async fn commit(mut self) -> Result<(), StoreError> {
        self.lease.conn_mut()?.commit().await?;
        self.completed = true;
        Ok(())
    }

    /// Roll the transaction back immediately.
    pub async fn rollback(mut self) -> Result<(), StoreError> {
        self.lease.conn_mut()?.rollback().await?;
        self.completed = true;
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.lease.pending_rollback = true;
        }
    }
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("completed", &self.completed)
            .finish_non_exhaustive()
    }
}
