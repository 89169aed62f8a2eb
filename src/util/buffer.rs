//! Batching prepared-insert accumulator
//!
//! Buffers rows for one target table and issues a single multi-row INSERT
//! through its executor whenever the batch fills, or on demand via `flush`.
//! Once the executor has failed the buffer is poisoned: every later call
//! returns the stored error until the owner discards the buffer.

use itertools::Itertools;
use std::sync::Arc;
use tokio_postgres::types::ToSql;

use crate::db::executor::SqlExecutor;
use crate::error::{Error, Result};

/// One buffered SQL value
pub type SqlParam = Box<dyn ToSql + Sync + Send>;

/// Batched N-row prepared insert
pub struct InsertBuffer {
    ex: Arc<dyn SqlExecutor>,
    stmt: String,
    capacity: usize,
    params_per_row: usize,
    stmt_wrap: bool,
    rows: Vec<Vec<SqlParam>>,
    failed: Option<Error>,
}

impl InsertBuffer {
    /// Create a buffer over `ex`.
    ///
    /// With `stmt_wrap` set, `stmt` is an INSERT prefix (column list, no
    /// VALUES) and the buffer appends one values-clause per buffered row.
    /// Without it, `stmt` is a complete statement with `params_per_row`
    /// placeholders, executed once per row at flush time.
    pub fn new(
        ex: Arc<dyn SqlExecutor>,
        stmt: String,
        capacity: usize,
        params_per_row: usize,
        stmt_wrap: bool,
    ) -> InsertBuffer {
        InsertBuffer {
            ex,
            stmt,
            capacity,
            params_per_row,
            stmt_wrap,
            rows: Vec::with_capacity(capacity),
            failed: None,
        }
    }

    /// Append one row of values, flushing if the batch is full.
    ///
    /// Fails with a parse error if the arity does not match the statement.
    pub async fn add(&mut self, values: Vec<SqlParam>) -> Result<()> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }
        if values.len() != self.params_per_row {
            return Err(Error::parse(format!(
                "insert arity mismatch: expected {} values per row, got {}",
                self.params_per_row,
                values.len()
            )));
        }

        self.rows.push(values);
        if self.rows.len() >= self.capacity {
            self.flush().await?;
        }
        Ok(())
    }

    /// Issue any partial batch. A no-op on an empty buffer.
    pub async fn flush(&mut self) -> Result<()> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }
        if self.rows.is_empty() {
            return Ok(());
        }

        let res = self.issue().await;
        self.rows.clear();
        if let Err(err) = &res {
            self.failed = Some(err.clone());
        }
        res
    }

    async fn issue(&self) -> Result<()> {
        if self.stmt_wrap {
            let values = (0..self.rows.len())
                .map(|row| {
                    let placeholders = (0..self.params_per_row)
                        .map(|col| format!("${}", row * self.params_per_row + col + 1))
                        .join(", ");
                    format!("({})", placeholders)
                })
                .join(", ");
            let stmt = format!("{} VALUES {};", self.stmt, values);

            let params: Vec<&(dyn ToSql + Sync)> = self
                .rows
                .iter()
                .flat_map(|row| row.iter().map(|v| v.as_ref() as &(dyn ToSql + Sync)))
                .collect();
            self.ex.exec(&stmt, &params).await?;
        } else {
            for row in &self.rows {
                let params: Vec<&(dyn ToSql + Sync)> = row
                    .iter()
                    .map(|v| v.as_ref() as &(dyn ToSql + Sync))
                    .collect();
                self.ex.exec(&self.stmt, &params).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio_postgres::Row;

    /// Records every executed statement with its parameter count.
    struct RecordingExecutor {
        executed: Mutex<Vec<(String, usize)>>,
        fail: bool,
    }

    impl RecordingExecutor {
        fn new(fail: bool) -> Arc<RecordingExecutor> {
            Arc::new(RecordingExecutor {
                executed: Mutex::new(Vec::new()),
                fail,
            })
        }
    }

    #[async_trait]
    impl SqlExecutor for RecordingExecutor {
        async fn exec(&self, stmt: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64> {
            if self.fail {
                return Err(Error::Db {
                    code: None,
                    message: "injected failure".to_string(),
                });
            }
            self.executed
                .lock()
                .unwrap()
                .push((stmt.to_string(), params.len()));
            Ok(params.len() as u64)
        }

        async fn query(&self, _stmt: &str, _params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>> {
            Ok(Vec::new())
        }

        async fn query_row(&self, _stmt: &str, _params: &[&(dyn ToSql + Sync)]) -> Result<Row> {
            Err(Error::programmer("query_row not supported by recorder"))
        }

        async fn done(&self) -> Result<()> {
            Ok(())
        }
    }

    fn row(a: i32, b: i32) -> Vec<SqlParam> {
        vec![Box::new(a), Box::new(b)]
    }

    #[tokio::test]
    async fn test_full_batch_issues_one_insert() {
        let ex = RecordingExecutor::new(false);
        let mut buf = InsertBuffer::new(ex.clone(), "INSERT INTO t (a, b)".to_string(), 3, 2, true);

        for i in 0..3 {
            buf.add(row(i, i + 1)).await.unwrap();
        }

        let executed = ex.executed.lock().unwrap();
        assert_eq!(executed.len(), 1);
        let (stmt, nparams) = &executed[0];
        assert_eq!(stmt, "INSERT INTO t (a, b) VALUES ($1, $2), ($3, $4), ($5, $6);");
        assert_eq!(*nparams, 6);
    }

    #[tokio::test]
    async fn test_partial_flush_and_empty_flush() {
        let ex = RecordingExecutor::new(false);
        let mut buf = InsertBuffer::new(ex.clone(), "INSERT INTO t (a, b)".to_string(), 40, 2, true);

        buf.add(row(1, 2)).await.unwrap();
        buf.flush().await.unwrap();
        buf.flush().await.unwrap();

        let executed = ex.executed.lock().unwrap();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].1, 2);
    }

    #[tokio::test]
    async fn test_arity_mismatch() {
        let ex = RecordingExecutor::new(false);
        let mut buf = InsertBuffer::new(ex, "INSERT INTO t (a, b)".to_string(), 40, 2, true);

        let res = buf.add(vec![Box::new(1_i32)]).await;
        assert!(matches!(res, Err(Error::Parse(_))));
    }

    #[tokio::test]
    async fn test_executor_error_poisons_buffer() {
        let ex = RecordingExecutor::new(true);
        let mut buf = InsertBuffer::new(ex, "INSERT INTO t (a, b)".to_string(), 1, 2, true);

        assert!(buf.add(row(1, 2)).await.is_err());
        // Subsequent adds return the stored error without touching the executor.
        assert!(buf.add(row(3, 4)).await.is_err());
        assert!(buf.flush().await.is_err());
    }

    #[tokio::test]
    async fn test_per_row_statements() {
        let ex = RecordingExecutor::new(false);
        let mut buf = InsertBuffer::new(
            ex.clone(),
            "INSERT INTO t (a, b) VALUES ($1, $2) ON CONFLICT (a) DO NOTHING;".to_string(),
            40,
            2,
            false,
        );

        buf.add(row(1, 2)).await.unwrap();
        buf.add(row(3, 4)).await.unwrap();
        buf.flush().await.unwrap();

        let executed = ex.executed.lock().unwrap();
        assert_eq!(executed.len(), 2);
        assert!(executed.iter().all(|(_, n)| *n == 2));
    }
}
