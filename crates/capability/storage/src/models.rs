//! 缓冲层数据模型
//!
//! - [`BufferRecord`]：缓冲记录（telemetry / analytics 两类）
//! - [`BufferBatch`]：一次取出的上传批次
//! - [`BufferStatus`]：监控用占用快照
//! - [`BufferOptions`]：容量上限与淘汰策略

use crate::eviction::EvictionPolicy;
use domain::{AnalyticsResult, TelemetryPoint, TelemetryValue};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 每行固定开销估算（主键、标志位、时间戳、索引）。
pub const ROW_OVERHEAD_BYTES: i64 = 64;
pub const BYTES_PER_MB: i64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Telemetry,
    Analytics,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Telemetry => "telemetry",
            RecordKind::Analytics => "analytics",
        }
    }

    pub fn all() -> [RecordKind; 2] {
        [RecordKind::Telemetry, RecordKind::Analytics]
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum BufferPayload {
    Telemetry(TelemetryPoint),
    Analytics(AnalyticsResult),
}

impl BufferPayload {
    pub fn kind(&self) -> RecordKind {
        match self {
            BufferPayload::Telemetry(_) => RecordKind::Telemetry,
            BufferPayload::Analytics(_) => RecordKind::Analytics,
        }
    }
}

/// 缓冲记录：保存时创建，上传确认后标记 processed，随后删除。
#[derive(Debug, Clone, PartialEq)]
pub struct BufferRecord {
    pub id: i64,
    pub payload: BufferPayload,
    pub created_at_ms: i64,
    pub processed: bool,
    pub batch_id: Option<String>,
    pub size_bytes: i64,
}

impl BufferRecord {
    pub fn kind(&self) -> RecordKind {
        self.payload.kind()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BufferBatch {
    pub batch_id: String,
    pub kind: RecordKind,
    /// 按创建顺序（id 升序）排列。
    pub records: Vec<BufferRecord>,
}

impl BufferBatch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn ids(&self) -> Vec<i64> {
        self.records.iter().map(|record| record.id).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BufferStatus {
    pub telemetry_pending: u64,
    pub telemetry_processed: u64,
    pub analytics_pending: u64,
    pub analytics_processed: u64,
    pub total_size_bytes: i64,
    pub size_mb: f64,
    pub max_size_mb: u64,
    pub utilization_percent: f64,
    pub oldest_pending_ms: Option<i64>,
    pub last_cleanup_ms: Option<i64>,
}

impl BufferStatus {
    pub fn pending(&self) -> u64 {
        self.telemetry_pending + self.analytics_pending
    }

    pub fn total_records(&self) -> u64 {
        self.pending() + self.telemetry_processed + self.analytics_processed
    }

    pub(crate) fn with_size(mut self, total_size_bytes: i64, max_size_mb: u64) -> Self {
        self.total_size_bytes = total_size_bytes;
        self.size_mb = total_size_bytes as f64 / BYTES_PER_MB as f64;
        self.max_size_mb = max_size_mb;
        self.utilization_percent = if max_size_mb > 0 {
            self.size_mb / max_size_mb as f64 * 100.0
        } else {
            0.0
        };
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BufferOptions {
    pub max_size_mb: u64,
    pub eviction: EvictionPolicy,
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self {
            max_size_mb: 100,
            eviction: EvictionPolicy::default(),
        }
    }
}

impl BufferOptions {
    pub fn max_size_bytes(&self) -> i64 {
        self.max_size_mb as i64 * BYTES_PER_MB
    }
}

/// 估算一条采集点占用字节数。
pub fn telemetry_size(point: &TelemetryPoint) -> i64 {
    let text = point.enterprise.len()
        + point.site.len()
        + point.area.len()
        + point.line.len()
        + point.machine.len()
        + point.tag.len()
        + point.unit.as_ref().map_or(0, String::len)
        + point.quality.as_str().len();
    let value = match &point.value {
        TelemetryValue::Float(_) => 8,
        TelemetryValue::Bool(_) => 1,
        TelemetryValue::String(raw) => raw.len(),
    };
    ROW_OVERHEAD_BYTES + (text + value) as i64
}

/// 估算一条分析结果占用字节数（按指标 JSON 长度计）。
pub fn analytics_size(result: &AnalyticsResult, metrics_json: &str) -> i64 {
    ROW_OVERHEAD_BYTES
        + (result.asset_id.len() + result.analytics_type.as_str().len() + metrics_json.len()) as i64
        + 8
}
