//! Statement executors
//!
//! Two executors implement the same capability set over the connection pool:
//!
//! - [`DirectExecutor`] runs each statement on a freshly checked-out
//!   connection under its own deadline; `done` is a no-op.
//! - [`TxExecutor`] checks out one connection at construction, opens a
//!   transaction on it, and runs every statement inside that transaction
//!   under a single shared deadline. `done` commits, unless an error has
//!   been recorded via `set_error`, in which case it rolls back. `done` is
//!   idempotent.
//!
//! Neither executor serializes callers itself: a transactional executor is
//! owned by exactly one stream, which is the only writer through it.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_postgres::{Object, Pool};
use tokio::time::{timeout, timeout_at, Instant};
use tokio_postgres::types::ToSql;
use tokio_postgres::Row;

use crate::error::{Error, Result};

/// Statement deadline shared by all executors
pub const CTX_TIMEOUT: Duration = Duration::from_secs(120);

/// Unified statement/transaction runner
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Execute a statement, returning the affected row count
    async fn exec(&self, stmt: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64>;

    /// Run a query returning all rows
    async fn query(&self, stmt: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>>;

    /// Run a query expected to return exactly one row
    async fn query_row(&self, stmt: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Row>;

    /// Release the executor. For transactional executors this commits or
    /// rolls back; calling it a second time is a no-op.
    async fn done(&self) -> Result<()>;

    /// Record an error so that `done` rolls back. A no-op on executors
    /// without transaction state.
    fn set_error(&self, _err: Error) {}
}

/// Pool-backed executor; every operation gets a fresh connection and deadline
pub struct DirectExecutor {
    pool: Pool,
    timeout: Duration,
}

impl DirectExecutor {
    pub fn new(pool: Pool) -> DirectExecutor {
        DirectExecutor {
            pool,
            timeout: CTX_TIMEOUT,
        }
    }
}

#[async_trait]
impl SqlExecutor for DirectExecutor {
    async fn exec(&self, stmt: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64> {
        let run = async {
            let conn = self.pool.get().await?;
            Ok::<u64, Error>(conn.execute(stmt, params).await?)
        };
        timeout(self.timeout, run).await.map_err(|_| Error::Timeout)?
    }

    async fn query(&self, stmt: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>> {
        let run = async {
            let conn = self.pool.get().await?;
            Ok::<Vec<Row>, Error>(conn.query(stmt, params).await?)
        };
        timeout(self.timeout, run).await.map_err(|_| Error::Timeout)?
    }

    async fn query_row(&self, stmt: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Row> {
        let run = async {
            let conn = self.pool.get().await?;
            Ok::<Row, Error>(conn.query_one(stmt, params).await?)
        };
        timeout(self.timeout, run).await.map_err(|_| Error::Timeout)?
    }

    async fn done(&self) -> Result<()> {
        Ok(())
    }
}

struct TxState {
    err: Option<Error>,
    finished: bool,
}

/// Executor bound to one open transaction
pub struct TxExecutor {
    conn: Object,
    deadline: Instant,
    state: Mutex<TxState>,
}

impl TxExecutor {
    /// Check out a connection and open a transaction on it. The given
    /// duration bounds the whole transaction, not each statement.
    pub async fn begin(pool: &Pool, within: Duration) -> Result<TxExecutor> {
        let deadline = Instant::now() + within;
        let conn = timeout_at(deadline, pool.get())
            .await
            .map_err(|_| Error::Timeout)??;
        timeout_at(deadline, conn.batch_execute("BEGIN;"))
            .await
            .map_err(|_| Error::Timeout)??;

        Ok(TxExecutor {
            conn,
            deadline,
            state: Mutex::new(TxState {
                err: None,
                finished: false,
            }),
        })
    }

    fn check_open(&self) -> Result<()> {
        let state = self.state.lock().unwrap();
        if state.finished {
            return Err(Error::programmer("statement on a finished transaction"));
        }
        Ok(())
    }
}

#[async_trait]
impl SqlExecutor for TxExecutor {
    async fn exec(&self, stmt: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64> {
        self.check_open()?;
        timeout_at(self.deadline, self.conn.execute(stmt, params))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(Error::from)
    }

    async fn query(&self, stmt: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>> {
        self.check_open()?;
        timeout_at(self.deadline, self.conn.query(stmt, params))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(Error::from)
    }

    async fn query_row(&self, stmt: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Row> {
        self.check_open()?;
        timeout_at(self.deadline, self.conn.query_one(stmt, params))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(Error::from)
    }

    async fn done(&self) -> Result<()> {
        let had_error = {
            let mut state = self.state.lock().unwrap();
            if state.finished {
                return Ok(());
            }
            state.finished = true;
            state.err.is_some()
        };

        let stmt = if had_error { "ROLLBACK;" } else { "COMMIT;" };
        timeout_at(self.deadline, self.conn.batch_execute(stmt))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(Error::from)
    }

    fn set_error(&self, err: Error) {
        let mut state = self.state.lock().unwrap();
        if state.err.is_none() {
            state.err = Some(err);
        }
    }
}
