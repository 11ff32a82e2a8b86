use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// 采集点质量标记（对应 OPC UA StatusCode 的粗粒度分类）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Quality {
    #[default]
    Good,
    Bad,
    Uncertain,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Good => "GOOD",
            Quality::Bad => "BAD",
            Quality::Uncertain => "UNCERTAIN",
        }
    }
}

impl FromStr for Quality {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "GOOD" => Ok(Quality::Good),
            "BAD" => Ok(Quality::Bad),
            "UNCERTAIN" => Ok(Quality::Uncertain),
            other => Err(format!("unknown quality: {other}")),
        }
    }
}

/// 采集值的数据类型。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TelemetryValue {
    Bool(bool),
    Float(f64),
    String(String),
}

impl TelemetryValue {
    /// 数值视图：布尔按 0/1 处理，字符串尝试解析，失败返回 None。
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TelemetryValue::Float(value) if value.is_finite() => Some(*value),
            TelemetryValue::Float(_) => None,
            TelemetryValue::Bool(value) => Some(if *value { 1.0 } else { 0.0 }),
            TelemetryValue::String(raw) => raw.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        }
    }

    /// 文本视图，用于状态标签匹配。
    pub fn as_text(&self) -> String {
        match self {
            TelemetryValue::Float(value) if value.fract() == 0.0 && value.abs() < 1e15 => {
                format!("{}", *value as i64)
            }
            TelemetryValue::Float(value) => value.to_string(),
            TelemetryValue::Bool(value) => value.to_string(),
            TelemetryValue::String(raw) => raw.trim().to_string(),
        }
    }
}

impl From<f64> for TelemetryValue {
    fn from(value: f64) -> Self {
        TelemetryValue::Float(value)
    }
}

impl From<bool> for TelemetryValue {
    fn from(value: bool) -> Self {
        TelemetryValue::Bool(value)
    }
}

impl From<&str> for TelemetryValue {
    fn from(value: &str) -> Self {
        TelemetryValue::String(value.to_string())
    }
}

/// 单条遥测采集点（ISA-95 层级寻址）。
///
/// 创建后不可变；身份为 `(machine, tag, ts_ms)`。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPoint {
    pub ts_ms: i64,
    pub enterprise: String,
    pub site: String,
    pub area: String,
    pub line: String,
    pub machine: String,
    pub tag: String,
    pub value: TelemetryValue,
    pub unit: Option<String>,
    pub quality: Quality,
}

impl TelemetryPoint {
    pub fn identity(&self) -> (&str, &str, i64) {
        (&self.machine, &self.tag, self.ts_ms)
    }

    pub fn is_good(&self) -> bool {
        self.quality == Quality::Good
    }
}

/// 分析类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalyticsType {
    Oee,
    Energy,
    Predictive,
}

impl AnalyticsType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalyticsType::Oee => "oee",
            AnalyticsType::Energy => "energy",
            AnalyticsType::Predictive => "predictive",
        }
    }
}

impl fmt::Display for AnalyticsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalyticsType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "oee" => Ok(AnalyticsType::Oee),
            "energy" => Ok(AnalyticsType::Energy),
            "predictive" => Ok(AnalyticsType::Predictive),
            other => Err(format!("unknown analytics type: {other}")),
        }
    }
}

/// 指标值；`InsufficientData` 序列化为 JSON null。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Flag(bool),
    Number(f64),
    Text(String),
    InsufficientData,
}

impl MetricValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MetricValue::Flag(value) => Some(*value),
            _ => None,
        }
    }

    pub fn is_insufficient(&self) -> bool {
        matches!(self, MetricValue::InsufficientData)
    }
}

impl From<Option<f64>> for MetricValue {
    fn from(value: Option<f64>) -> Self {
        match value {
            Some(value) if value.is_finite() => MetricValue::Number(value),
            _ => MetricValue::InsufficientData,
        }
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        Some(value).into()
    }
}

impl From<bool> for MetricValue {
    fn from(value: bool) -> Self {
        MetricValue::Flag(value)
    }
}

impl From<&str> for MetricValue {
    fn from(value: &str) -> Self {
        MetricValue::Text(value.to_string())
    }
}

/// 分析结果（由 AnalyticsEngine 产出，不可变）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsResult {
    pub ts_ms: i64,
    pub asset_id: String,
    pub analytics_type: AnalyticsType,
    pub metrics: BTreeMap<String, MetricValue>,
    pub score: Option<f64>,
}

impl AnalyticsResult {
    pub fn new(ts_ms: i64, asset_id: impl Into<String>, analytics_type: AnalyticsType) -> Self {
        Self {
            ts_ms,
            asset_id: asset_id.into(),
            analytics_type,
            metrics: BTreeMap::new(),
            score: None,
        }
    }

    pub fn with_metric(mut self, name: &str, value: impl Into<MetricValue>) -> Self {
        self.metrics.insert(name.to_string(), value.into());
        self
    }

    pub fn with_score(mut self, score: Option<f64>) -> Self {
        self.score = score.filter(|s| s.is_finite()).map(|s| s.clamp(0.0, 100.0));
        self
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).and_then(MetricValue::as_f64)
    }

    pub fn flag(&self, name: &str) -> Option<bool> {
        self.metrics.get(name).and_then(MetricValue::as_bool)
    }
}
