//! 稳定的 DTO 与 API 响应契约。

use serde::{Deserialize, Serialize};

/// 标准 API 响应封装。
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ApiError>,
}

/// 失败响应的错误体。
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ApiError {
                code: code.into(),
                message: message.into(),
            }),
        }
    }
}

/// 整体健康状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl OverallStatus {
    /// 全部资产已连接且上传正常为 healthy；资产全部失败为 unhealthy；其余为 degraded。
    pub fn evaluate(asset_health: &[AssetHealth], upload_healthy: bool) -> Self {
        let failed = asset_health
            .iter()
            .filter(|asset| asset.health == "failed")
            .count();
        if !asset_health.is_empty() && failed == asset_health.len() {
            return OverallStatus::Unhealthy;
        }
        let all_connected = asset_health.iter().all(|asset| asset.health == "connected");
        if all_connected && upload_healthy {
            OverallStatus::Healthy
        } else {
            OverallStatus::Degraded
        }
    }
}

/// 单个资产的连接健康。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetHealth {
    pub asset_name: String,
    /// connected / reconnecting / failed
    pub health: String,
}

/// `GET /health` 响应体。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: OverallStatus,
    pub uptime_secs: u64,
    pub upload_healthy: bool,
    pub assets: Vec<AssetHealth>,
}

/// 资产连接详情。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetStatus {
    pub asset_name: String,
    pub endpoint: String,
    pub phase: String,
    pub health: String,
    pub security_policy: Option<String>,
    pub attempt_count: u32,
    pub next_retry_at_ms: Option<i64>,
    pub connected_since_ms: Option<i64>,
    pub last_error: Option<String>,
}

/// 本地缓冲占用。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferStatusView {
    pub telemetry_pending: u64,
    pub telemetry_processed: u64,
    pub analytics_pending: u64,
    pub analytics_processed: u64,
    pub size_mb: f64,
    pub max_size_mb: u64,
    pub utilization_percent: f64,
    pub oldest_pending_ms: Option<i64>,
    pub last_cleanup_ms: Option<i64>,
}

/// 上传统计。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatusView {
    pub healthy: bool,
    pub cycles: u64,
    pub batches_sent: u64,
    pub records_sent: u64,
    pub failures: u64,
    pub success_rate: Option<f64>,
    pub last_success_ms: Option<i64>,
    pub last_error: Option<String>,
}

/// `GET /status` 响应体；缓冲不可读时 `buffer` 为空。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub enterprise: String,
    pub assets: Vec<AssetStatus>,
    pub buffer: Option<BufferStatusView>,
    pub upload: UploadStatusView,
}
