pub mod asset;
pub mod data;

pub use asset::{
    AssetConfiguration, AssetMetadata, EnergyConfig, EnergyKpiConfig, EnergyPattern, MonitoredTag,
    OeeConfig, PredictiveConfig, RateDirection, RateLimit,
};
pub use data::{
    AnalyticsResult, AnalyticsType, MetricValue, Quality, TelemetryPoint, TelemetryValue,
};

/// 当前 Unix 毫秒时间戳。
pub fn now_epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}
