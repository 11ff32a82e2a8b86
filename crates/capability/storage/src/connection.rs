//! 数据库连接管理
//!
//! 提供 SQLite 连接池初始化：
//! - WAL 日志 + `synchronous=FULL`：提交返回即已落盘
//! - 单连接池：所有读写串行化（单写者）

use crate::error::BufferError;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use std::path::Path;
use std::time::Duration;

/// 建立 SQLite 连接池，文件及父目录不存在时自动创建。
pub async fn connect_sqlite(path: &Path) -> Result<SqlitePool, BufferError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|err| BufferError::storage(format!("create buffer dir: {err}")))?;
        }
    }
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await?;
    Ok(pool)
}
