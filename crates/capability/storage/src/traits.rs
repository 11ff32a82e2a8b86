//! 本地缓冲接口
//!
//! 设计约束：
//! - `save_*` 返回成功即已落盘（崩溃后不丢失）
//! - 单一上传者：同一时刻只有一个调用方执行 get_batch → mark_processed → delete_batch
//! - 所有写入串行化，批量写入全有或全无

use crate::error::BufferError;
use crate::eviction::EvictionReport;
use crate::models::{BufferBatch, BufferRecord, BufferStatus, RecordKind};
use async_trait::async_trait;
use domain::{AnalyticsResult, TelemetryPoint};

#[async_trait]
pub trait LocalBuffer: Send + Sync {
    /// 持久化单个采集点，返回记录 ID。
    async fn save_point(&self, point: &TelemetryPoint) -> Result<i64, BufferError>;

    /// 持久化单个分析结果，返回记录 ID。
    async fn save_analytics(&self, result: &AnalyticsResult) -> Result<i64, BufferError>;

    /// 在同一事务中持久化采集点与其派生的分析结果，返回写入条数。
    async fn save_batch(
        &self,
        points: &[TelemetryPoint],
        results: &[AnalyticsResult],
    ) -> Result<usize, BufferError>;

    /// 取出最多 `max_size` 条未上传记录（最旧优先），打上新的批次 ID。
    ///
    /// 无待上传记录时返回 None。
    async fn get_batch(
        &self,
        kind: RecordKind,
        max_size: usize,
    ) -> Result<Option<BufferBatch>, BufferError>;

    /// 按批次 ID 读取记录（含已上传记录）。
    async fn get_batch_by_id(&self, batch_id: &str) -> Result<Vec<BufferRecord>, BufferError>;

    /// 将批次标记为已上传（幂等），返回受影响条数。
    async fn mark_processed(&self, batch_id: &str) -> Result<u64, BufferError>;

    /// 删除批次中已上传的记录，未上传的记录保持不动。
    async fn delete_batch(&self, batch_id: &str) -> Result<u64, BufferError>;

    async fn get_buffer_status(&self) -> Result<BufferStatus, BufferError>;

    /// 超出容量上限时按淘汰策略清理。
    async fn enforce_size_limit(&self) -> Result<EvictionReport, BufferError>;

    /// 删除早于 `cutoff_ms` 创建的已上传记录，返回删除条数。
    async fn cleanup_processed_older_than(&self, cutoff_ms: i64) -> Result<u64, BufferError>;

    /// 刷盘并关闭；之后的调用返回 `BufferError::Closed`。
    async fn close(&self) -> Result<(), BufferError>;
}
