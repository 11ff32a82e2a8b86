//! 运行时状态到 DTO 的转换

use api_contract::{AssetHealth, AssetStatus, BufferStatusView, UploadStatusView};
use edge_storage::BufferStatus;
use edge_upload::UploadStats;

use crate::state::AssetHandle;

pub fn asset_health(handle: &AssetHandle) -> AssetHealth {
    AssetHealth {
        asset_name: handle.asset_name.clone(),
        health: handle.snapshot().health().as_str().to_string(),
    }
}

pub fn asset_status(handle: &AssetHandle) -> AssetStatus {
    let state = handle.snapshot();
    AssetStatus {
        asset_name: handle.asset_name.clone(),
        health: state.health().as_str().to_string(),
        phase: state.phase.as_str().to_string(),
        endpoint: state.endpoint,
        security_policy: state.security_policy.map(|policy| policy.as_str().to_string()),
        attempt_count: state.attempt_count,
        next_retry_at_ms: state.next_retry_at_ms,
        connected_since_ms: state.connected_since_ms,
        last_error: state.last_error,
    }
}

pub fn buffer_to_view(status: BufferStatus) -> BufferStatusView {
    BufferStatusView {
        telemetry_pending: status.telemetry_pending,
        telemetry_processed: status.telemetry_processed,
        analytics_pending: status.analytics_pending,
        analytics_processed: status.analytics_processed,
        size_mb: status.size_mb,
        max_size_mb: status.max_size_mb,
        utilization_percent: status.utilization_percent,
        oldest_pending_ms: status.oldest_pending_ms,
        last_cleanup_ms: status.last_cleanup_ms,
    }
}

pub fn upload_to_view(stats: UploadStats, healthy: bool) -> UploadStatusView {
    UploadStatusView {
        healthy,
        cycles: stats.cycles,
        batches_sent: stats.batches_sent,
        records_sent: stats.records_sent,
        failures: stats.failures,
        success_rate: stats.success_rate,
        last_success_ms: stats.last_success_ms,
        last_error: stats.last_error,
    }
}
