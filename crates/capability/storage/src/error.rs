//! 缓冲层错误类型
//!
//! 封装底层错误：
//! - SQLite 执行与连接错误
//! - 载荷序列化错误
//! - 关闭后继续访问

#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("buffer closed")]
    Closed,
}

impl BufferError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }
}

impl From<sqlx::Error> for BufferError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolClosed => Self::Closed,
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for BufferError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
