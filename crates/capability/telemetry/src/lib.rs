//! 追踪初始化、请求 ID 生成与进程内计数指标。

use serde::Serialize;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::{EnvFilter, fmt};

/// 请求级追踪标识。
#[derive(Debug, Clone)]
pub struct RequestIds {
    pub request_id: String,
    pub trace_id: String,
}

/// 指标快照（单调递增计数）。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub points_received: u64,
    pub points_skipped: u64,
    pub points_buffered: u64,
    pub points_dropped: u64,
    pub analytics_emitted: u64,
    pub upload_batches_ok: u64,
    pub upload_batches_failed: u64,
    pub upload_records_sent: u64,
    pub upload_latency_ms_total: u64,
    pub upload_latency_ms_count: u64,
    pub evicted_processed: u64,
    pub purged_unprocessed: u64,
    pub retention_deleted: u64,
    pub reconnect_attempts: u64,
}

impl MetricsSnapshot {
    /// 平均上传耗时（毫秒），无样本时为 None。
    pub fn avg_upload_latency_ms(&self) -> Option<f64> {
        if self.upload_latency_ms_count == 0 {
            return None;
        }
        Some(self.upload_latency_ms_total as f64 / self.upload_latency_ms_count as f64)
    }
}

/// 进程内指标
pub struct TelemetryMetrics {
    points_received: AtomicU64,
    points_skipped: AtomicU64,
    points_buffered: AtomicU64,
    points_dropped: AtomicU64,
    analytics_emitted: AtomicU64,
    upload_batches_ok: AtomicU64,
    upload_batches_failed: AtomicU64,
    upload_records_sent: AtomicU64,
    upload_latency_ms_total: AtomicU64,
    upload_latency_ms_count: AtomicU64,
    evicted_processed: AtomicU64,
    purged_unprocessed: AtomicU64,
    retention_deleted: AtomicU64,
    reconnect_attempts: AtomicU64,
}

impl TelemetryMetrics {
    pub fn new() -> Self {
        Self {
            points_received: AtomicU64::new(0),
            points_skipped: AtomicU64::new(0),
            points_buffered: AtomicU64::new(0),
            points_dropped: AtomicU64::new(0),
            analytics_emitted: AtomicU64::new(0),
            upload_batches_ok: AtomicU64::new(0),
            upload_batches_failed: AtomicU64::new(0),
            upload_records_sent: AtomicU64::new(0),
            upload_latency_ms_total: AtomicU64::new(0),
            upload_latency_ms_count: AtomicU64::new(0),
            evicted_processed: AtomicU64::new(0),
            purged_unprocessed: AtomicU64::new(0),
            retention_deleted: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            points_received: self.points_received.load(Ordering::Relaxed),
            points_skipped: self.points_skipped.load(Ordering::Relaxed),
            points_buffered: self.points_buffered.load(Ordering::Relaxed),
            points_dropped: self.points_dropped.load(Ordering::Relaxed),
            analytics_emitted: self.analytics_emitted.load(Ordering::Relaxed),
            upload_batches_ok: self.upload_batches_ok.load(Ordering::Relaxed),
            upload_batches_failed: self.upload_batches_failed.load(Ordering::Relaxed),
            upload_records_sent: self.upload_records_sent.load(Ordering::Relaxed),
            upload_latency_ms_total: self.upload_latency_ms_total.load(Ordering::Relaxed),
            upload_latency_ms_count: self.upload_latency_ms_count.load(Ordering::Relaxed),
            evicted_processed: self.evicted_processed.load(Ordering::Relaxed),
            purged_unprocessed: self.purged_unprocessed.load(Ordering::Relaxed),
            retention_deleted: self.retention_deleted.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
        }
    }
}

impl Default for TelemetryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

static METRICS: OnceLock<TelemetryMetrics> = OnceLock::new();

/// 获取全局指标实例。
pub fn metrics() -> &'static TelemetryMetrics {
    METRICS.get_or_init(TelemetryMetrics::new)
}

/// 初始化 tracing（默认 info，可由 RUST_LOG 覆盖）。
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

/// 生成新的 request_id 与 trace_id。
pub fn new_request_ids() -> RequestIds {
    RequestIds {
        request_id: uuid::Uuid::new_v4().to_string(),
        trace_id: uuid::Uuid::new_v4().to_string(),
    }
}

/// 记录收到的采集点。
pub fn record_point_received() {
    metrics().points_received.fetch_add(1, Ordering::Relaxed);
}

/// 记录被跳过的采集点（未映射节点、质量不佳等）。
pub fn record_point_skipped() {
    metrics().points_skipped.fetch_add(1, Ordering::Relaxed);
}

/// 记录写入缓冲的采集点数。
pub fn record_points_buffered(count: u64) {
    metrics().points_buffered.fetch_add(count, Ordering::Relaxed);
}

/// 记录因缓冲写入失败而丢弃的采集点数。
pub fn record_points_dropped(count: u64) {
    metrics().points_dropped.fetch_add(count, Ordering::Relaxed);
}

/// 记录产出的分析结果数。
pub fn record_analytics_emitted(count: u64) {
    metrics().analytics_emitted.fetch_add(count, Ordering::Relaxed);
}

/// 记录上传成功的批次及记录数。
pub fn record_upload_success(records: u64, latency_ms: u64) {
    let metrics = metrics();
    metrics.upload_batches_ok.fetch_add(1, Ordering::Relaxed);
    metrics
        .upload_records_sent
        .fetch_add(records, Ordering::Relaxed);
    metrics
        .upload_latency_ms_total
        .fetch_add(latency_ms, Ordering::Relaxed);
    metrics
        .upload_latency_ms_count
        .fetch_add(1, Ordering::Relaxed);
}

/// 记录上传失败的批次。
pub fn record_upload_failure() {
    metrics()
        .upload_batches_failed
        .fetch_add(1, Ordering::Relaxed);
}

/// 记录容量淘汰删除的已上传记录数。
pub fn record_evicted_processed(count: u64) {
    metrics()
        .evicted_processed
        .fetch_add(count, Ordering::Relaxed);
}

/// 记录容量超限清除的未上传记录数（数据丢失）。
pub fn record_purged_unprocessed(count: u64) {
    metrics()
        .purged_unprocessed
        .fetch_add(count, Ordering::Relaxed);
}

/// 记录保留期清理删除的记录数。
pub fn record_retention_deleted(count: u64) {
    metrics()
        .retention_deleted
        .fetch_add(count, Ordering::Relaxed);
}

/// 记录 OPC UA 重连尝试次数。
pub fn record_reconnect_attempt() {
    metrics()
        .reconnect_attempts
        .fetch_add(1, Ordering::Relaxed);
}
