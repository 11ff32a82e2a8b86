//! 资产配置（外部只读输入）。
//!
//! 声明资产的 OPC UA 端点、标签到节点的映射，以及各分析模块所需的标签与阈值。
//! 分析引擎只读取，从不修改。

use crate::data::{Quality, TelemetryPoint, TelemetryValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const UNKNOWN: &str = "Unknown";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetMetadata {
    #[serde(default)]
    pub site: Option<String>,
    #[serde(default)]
    pub area: Option<String>,
    #[serde(default)]
    pub line: Option<String>,
}

impl AssetMetadata {
    pub fn site(&self) -> &str {
        self.site.as_deref().unwrap_or(UNKNOWN)
    }

    pub fn area(&self) -> &str {
        self.area.as_deref().unwrap_or(UNKNOWN)
    }

    pub fn line(&self) -> &str {
        self.line.as_deref().unwrap_or(UNKNOWN)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetConfiguration {
    pub asset_name: String,
    #[serde(default)]
    pub asset_type: Option<String>,
    #[serde(alias = "opcua_endpoint")]
    pub endpoint: String,
    /// tag 名 → OPC UA 节点 ID。
    #[serde(default)]
    pub node_mapping: BTreeMap<String, String>,
    #[serde(default)]
    pub units: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata: AssetMetadata,
    #[serde(default)]
    pub oee: Option<OeeConfig>,
    #[serde(default)]
    pub energy: Option<EnergyConfig>,
    #[serde(default)]
    pub predictive: Option<PredictiveConfig>,
}

impl AssetConfiguration {
    pub fn new(asset_name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            asset_name: asset_name.into(),
            asset_type: None,
            endpoint: endpoint.into(),
            node_mapping: BTreeMap::new(),
            units: BTreeMap::new(),
            metadata: AssetMetadata::default(),
            oee: None,
            energy: None,
            predictive: None,
        }
    }

    /// 按节点 ID 反查 tag 名。
    pub fn tag_for_node(&self, node_id: &str) -> Option<&str> {
        self.node_mapping
            .iter()
            .find(|(_, mapped)| mapped.as_str() == node_id)
            .map(|(tag, _)| tag.as_str())
    }

    /// 应用端点覆盖与逐 tag 的节点 ID 覆盖（`node_override` 以 tag 名查询）。
    pub fn with_overrides(
        mut self,
        endpoint: Option<&str>,
        mut node_override: impl FnMut(&str) -> Option<String>,
    ) -> Self {
        if let Some(endpoint) = endpoint.map(str::trim).filter(|value| !value.is_empty()) {
            self.endpoint = endpoint.to_string();
        }
        for (tag, node_id) in self.node_mapping.iter_mut() {
            if let Some(replacement) = node_override(tag) {
                *node_id = replacement;
            }
        }
        self
    }

    /// 以该资产的层级信息构造采集点。
    pub fn point(
        &self,
        enterprise: &str,
        tag: &str,
        value: TelemetryValue,
        quality: Quality,
        ts_ms: i64,
    ) -> TelemetryPoint {
        TelemetryPoint {
            ts_ms,
            enterprise: enterprise.to_string(),
            site: self.metadata.site().to_string(),
            area: self.metadata.area().to_string(),
            line: self.metadata.line().to_string(),
            machine: self.asset_name.clone(),
            tag: tag.to_string(),
            value,
            unit: self.units.get(tag).cloned(),
            quality,
        }
    }
}

fn default_interval_secs() -> u64 {
    300
}

fn default_running_states() -> Vec<String> {
    vec!["running".to_string(), "1".to_string(), "true".to_string()]
}

/// OEE 分析配置。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OeeConfig {
    pub state_tag: String,
    #[serde(default = "default_running_states")]
    pub running_states: Vec<String>,
    pub total_count_tag: String,
    #[serde(default)]
    pub good_count_tag: Option<String>,
    #[serde(default)]
    pub reject_count_tag: Option<String>,
    /// 理想节拍（件/分钟）。
    pub ideal_rate_per_min: f64,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

/// 能耗分析配置。功率单位 kW，电压 V，电流 A。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyConfig {
    pub power_tag: String,
    #[serde(default)]
    pub voltage_tag: Option<String>,
    #[serde(default)]
    pub current_tag: Option<String>,
    #[serde(default)]
    pub power_factor_tag: Option<String>,
    #[serde(default)]
    pub three_phase: bool,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub kpi: Option<EnergyKpiConfig>,
}

/// 能源 KPI 标签分组；同组多个标签的样本合并统计。
///
/// 可再生出力与负荷单位 kW，电池 SoC 与系统效率单位 %。
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EnergyKpiConfig {
    #[serde(default)]
    pub renewable_tags: Vec<String>,
    #[serde(default)]
    pub load_tags: Vec<String>,
    #[serde(default)]
    pub battery_soc_tags: Vec<String>,
    #[serde(default)]
    pub efficiency_tags: Vec<String>,
}

impl EnergyKpiConfig {
    pub fn watches(&self, tag: &str) -> bool {
        [
            &self.renewable_tags,
            &self.load_tags,
            &self.battery_soc_tags,
            &self.efficiency_tags,
        ]
        .iter()
        .any(|tags| tags.iter().any(|t| t == tag))
    }
}

fn default_spike_ratio() -> f64 {
    2.0
}

fn default_spike_high_ratio() -> f64 {
    3.0
}

fn default_spike_recent_secs() -> u64 {
    60
}

fn default_spike_baseline_secs() -> u64 {
    240
}

fn default_voltage_percent() -> f64 {
    10.0
}

fn default_voltage_high_percent() -> f64 {
    15.0
}

fn default_voltage_recent_secs() -> u64 {
    120
}

fn default_voltage_baseline_secs() -> u64 {
    480
}

fn default_efficiency_drop_points() -> f64 {
    15.0
}

fn default_efficiency_high_points() -> f64 {
    25.0
}

fn default_efficiency_span_secs() -> u64 {
    300
}

/// 能源类异常模式：比较最近时段与之前基线时段的统计量。
///
/// 历史数据未覆盖两个时段时不做判断。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EnergyPattern {
    /// 最近时段峰值 / 基线均值 超过 `ratio`。
    PowerSpike {
        #[serde(default = "default_spike_ratio")]
        ratio: f64,
        #[serde(default = "default_spike_high_ratio")]
        high_ratio: f64,
        #[serde(default = "default_spike_recent_secs")]
        recent_secs: u64,
        #[serde(default = "default_spike_baseline_secs")]
        baseline_secs: u64,
    },
    /// 最近时段均值偏离基线均值超过 `percent`%。
    VoltageDeviation {
        #[serde(default = "default_voltage_percent")]
        percent: f64,
        #[serde(default = "default_voltage_high_percent")]
        high_percent: f64,
        #[serde(default = "default_voltage_recent_secs")]
        recent_secs: u64,
        #[serde(default = "default_voltage_baseline_secs")]
        baseline_secs: u64,
    },
    /// 前后两个等长时段的效率均值下降超过 `points` 个百分点。
    EfficiencyDrop {
        #[serde(default = "default_efficiency_drop_points")]
        points: f64,
        #[serde(default = "default_efficiency_high_points")]
        high_points: f64,
        #[serde(default = "default_efficiency_span_secs")]
        span_secs: u64,
    },
}

impl EnergyPattern {
    pub fn power_spike() -> Self {
        EnergyPattern::PowerSpike {
            ratio: default_spike_ratio(),
            high_ratio: default_spike_high_ratio(),
            recent_secs: default_spike_recent_secs(),
            baseline_secs: default_spike_baseline_secs(),
        }
    }

    pub fn voltage_deviation() -> Self {
        EnergyPattern::VoltageDeviation {
            percent: default_voltage_percent(),
            high_percent: default_voltage_high_percent(),
            recent_secs: default_voltage_recent_secs(),
            baseline_secs: default_voltage_baseline_secs(),
        }
    }

    pub fn efficiency_drop() -> Self {
        EnergyPattern::EfficiencyDrop {
            points: default_efficiency_drop_points(),
            high_points: default_efficiency_high_points(),
            span_secs: default_efficiency_span_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateDirection {
    Drop,
    Rise,
    #[default]
    Either,
}

/// 变化率阈值：`window_secs` 内变化超过 `percent`% 视为异常。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    pub percent: f64,
    pub window_secs: u64,
    #[serde(default)]
    pub direction: RateDirection,
}

fn default_z_threshold() -> f64 {
    3.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredTag {
    pub tag: String,
    #[serde(default = "default_z_threshold")]
    pub z_threshold: f64,
    #[serde(default)]
    pub rate_limit: Option<RateLimit>,
    #[serde(default)]
    pub high_limit: Option<f64>,
    #[serde(default)]
    pub low_limit: Option<f64>,
    #[serde(default)]
    pub pattern: Option<EnergyPattern>,
}

impl MonitoredTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            z_threshold: default_z_threshold(),
            rate_limit: None,
            high_limit: None,
            low_limit: None,
            pattern: None,
        }
    }

    pub fn with_pattern(mut self, pattern: EnergyPattern) -> Self {
        self.pattern = Some(pattern);
        self
    }
}

fn default_window_secs() -> u64 {
    1800
}

fn default_min_baseline_secs() -> u64 {
    900
}

fn default_min_samples() -> usize {
    30
}

fn default_anomaly_memory_secs() -> u64 {
    3600
}

/// 预测性维护配置。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictiveConfig {
    #[serde(default)]
    pub tags: Vec<MonitoredTag>,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_min_baseline_secs")]
    pub min_baseline_secs: u64,
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    #[serde(default = "default_interval_secs")]
    pub summary_interval_secs: u64,
    #[serde(default = "default_anomaly_memory_secs")]
    pub anomaly_memory_secs: u64,
}

impl Default for PredictiveConfig {
    fn default() -> Self {
        Self {
            tags: Vec::new(),
            window_secs: default_window_secs(),
            min_baseline_secs: default_min_baseline_secs(),
            min_samples: default_min_samples(),
            summary_interval_secs: default_interval_secs(),
            anomaly_memory_secs: default_anomaly_memory_secs(),
        }
    }
}
