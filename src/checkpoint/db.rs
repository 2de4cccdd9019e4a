// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Checkpoint persistence seam.
//!
//! The engine speaks to its durable store through [`CheckpointDb`], a
//! two-method surface (batched execute + point query). Production uses
//! [`MySqlCheckpointDb`] over an `sqlx` pool; tests use a recording mock.

use crate::error::{EngineError, Result};
use sqlx::mysql::MySqlPool;
use sqlx::Row;
use std::future::Future;
use std::pin::Pin;

/// Type alias for boxed store futures.
pub type BoxDbFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// A positional SQL parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Str(String),
    U32(u32),
    Bool(bool),
}

impl SqlParam {
    /// The textual form, for logs and for mocks reconstructing state.
    pub fn as_text(&self) -> String {
        match self {
            SqlParam::Str(s) => s.clone(),
            SqlParam::U32(v) => v.to_string(),
            SqlParam::Bool(v) => v.to_string(),
        }
    }
}

/// One persisted checkpoint row.
#[derive(Debug, Clone, Default)]
pub struct CheckpointRow {
    pub cp_schema: String,
    pub cp_table: String,
    pub binlog_name: String,
    pub binlog_pos: u32,
    pub binlog_gtid: Option<String>,
    pub exit_safe_binlog_name: String,
    pub exit_safe_binlog_pos: u32,
    pub exit_safe_binlog_gtid: Option<String>,
    /// JSON text of the schema snapshot; `"null"` for the global row.
    pub table_info: String,
    pub is_global: bool,
}

/// Durable store for checkpoint rows.
pub trait CheckpointDb: Send + Sync + 'static {
    /// Execute a batch of statements with positional parameters, atomically.
    fn execute(&self, sqls: Vec<String>, params: Vec<Vec<SqlParam>>) -> BoxDbFuture<'_, ()>;

    /// All rows persisted for the given checkpoint id.
    fn query_rows(&self, id: String) -> BoxDbFuture<'_, Vec<CheckpointRow>>;

    /// Release connections.
    fn close(&self) -> BoxDbFuture<'_, ()>;
}

/// [`CheckpointDb`] over a MySQL-compatible target database.
pub struct MySqlCheckpointDb {
    pool: MySqlPool,
    table_name: String,
}

impl MySqlCheckpointDb {
    pub fn new(pool: MySqlPool, table_name: String) -> Self {
        Self { pool, table_name }
    }
}

impl CheckpointDb for MySqlCheckpointDb {
    fn execute(&self, sqls: Vec<String>, params: Vec<Vec<SqlParam>>) -> BoxDbFuture<'_, ()> {
        Box::pin(async move {
            let mut txn = self.pool.begin().await?;
            for (i, sql) in sqls.iter().enumerate() {
                let mut query = sqlx::query(sql);
                if let Some(args) = params.get(i) {
                    for arg in args {
                        query = match arg {
                            SqlParam::Str(s) => query.bind(s.clone()),
                            SqlParam::U32(v) => query.bind(*v),
                            SqlParam::Bool(v) => query.bind(*v),
                        };
                    }
                }
                query.execute(&mut *txn).await?;
            }
            txn.commit().await?;
            Ok(())
        })
    }

    fn query_rows(&self, id: String) -> BoxDbFuture<'_, Vec<CheckpointRow>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT cp_schema, cp_table, binlog_name, binlog_pos, binlog_gtid, \
                 exit_safe_binlog_name, exit_safe_binlog_pos, exit_safe_binlog_gtid, \
                 CAST(table_info AS CHAR) AS table_info, is_global \
                 FROM {} WHERE id = ?",
                self.table_name
            );
            let rows = sqlx::query(&sql).bind(id).fetch_all(&self.pool).await?;
            rows.into_iter()
                .map(|row| {
                    Ok(CheckpointRow {
                        cp_schema: row.try_get("cp_schema")?,
                        cp_table: row.try_get("cp_table")?,
                        binlog_name: row.try_get("binlog_name")?,
                        binlog_pos: row.try_get("binlog_pos")?,
                        binlog_gtid: row.try_get("binlog_gtid")?,
                        exit_safe_binlog_name: row.try_get("exit_safe_binlog_name")?,
                        exit_safe_binlog_pos: row.try_get("exit_safe_binlog_pos")?,
                        exit_safe_binlog_gtid: row.try_get("exit_safe_binlog_gtid")?,
                        table_info: row.try_get("table_info")?,
                        is_global: row.try_get("is_global")?,
                    })
                })
                .collect::<std::result::Result<Vec<_>, sqlx::Error>>()
                .map_err(EngineError::from)
        })
    }

    fn close(&self) -> BoxDbFuture<'_, ()> {
        Box::pin(async move {
            self.pool.close().await;
            Ok(())
        })
    }
}
