//! SQLite 缓冲实现模块
//!
//! 表结构：
//! - `telemetry`：原始采集点（值拆分为 value_float / value_string / value_bool）
//! - `analytics`：分析结果（指标以 JSON 存储）
//! - `buffer_metadata`：总字节数估算、最近清理时间

pub mod buffer;
pub mod schema;

pub use buffer::SqliteBuffer;
