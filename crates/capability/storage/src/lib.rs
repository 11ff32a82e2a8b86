//! # Edge Storage 模块
//!
//! 本模块提供边缘侧本地缓冲（LocalBuffer）：在云端不可达期间持久保存采集点与分析结果，
//! 恢复后由上传协调器按批次取出、确认、删除。
//!
//! ## 架构设计
//!
//! 1. **接口抽象层** (`traits.rs`)：[`LocalBuffer`] 异步 Trait
//! 2. **数据模型层** (`models.rs`)：记录、批次、占用快照
//! 3. **淘汰策略层** (`eviction.rs`)：容量超限时的淘汰顺序与日志
//! 4. **错误处理层** (`error.rs`)：统一的 [`BufferError`]
//! 5. **连接管理层** (`connection.rs`)：SQLite 连接池
//! 6. **实现层**：
//!    - `in_memory/`：内存实现（测试、演示）
//!    - `sqlite/`：SQLite 实现（生产环境）
//!
//! ## 记录生命周期
//!
//! ```text
//! save_* ──► processed=false ──mark_processed──► processed=true ──delete_batch──► 删除
//!                  │                                   │
//!                  └──── 容量超限清除（有损） ◄─────────┴──── 保留期清理 / 容量淘汰（正常）
//! ```
//!
//! ## 持久化保证
//!
//! - `save_*` 返回成功前事务已提交（WAL + `synchronous=FULL`）
//! - `save_batch` 中采集点与分析结果同一事务写入，全有或全无
//! - 单连接池 + 写锁：写路径串行化，批次取出/确认/删除对其他写入方原子可见
//!
//! ## 容量管理
//!
//! 总字节数为逐行估算值（见 [`models::telemetry_size`]），打开时按现有记录重新计算。
//! 超出上限时按 [`EvictionPolicy`] 淘汰：默认先删已上传记录，不足时再清除最旧的未上传记录，
//! 后者以 `unprocessed_purged` 单独告警。
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! use edge_storage::{BufferOptions, LocalBuffer, RecordKind, SqliteBuffer};
//!
//! let buffer = SqliteBuffer::open("data/edge_buffer.db", BufferOptions::default()).await?;
//! buffer.save_batch(&points, &results).await?;
//! if let Some(batch) = buffer.get_batch(RecordKind::Telemetry, 100).await? {
//!     // 上传成功后
//!     buffer.mark_processed(&batch.batch_id).await?;
//!     buffer.delete_batch(&batch.batch_id).await?;
//! }
//! buffer.close().await?;
//! ```

pub mod connection;
pub mod error;
pub mod eviction;
pub mod in_memory;
pub mod models;
pub mod sqlite;
pub mod traits;

pub use connection::*;
pub use error::*;
pub use eviction::{
    EvictionCandidate, EvictionOrder, EvictionPhase, EvictionPolicy, EvictionReport,
    KindPreference, select_victims,
};
pub use in_memory::InMemoryBuffer;
pub use models::*;
pub use sqlite::SqliteBuffer;
pub use traits::*;
