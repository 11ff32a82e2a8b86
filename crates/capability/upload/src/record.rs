//! 云端记录编码
//!
//! 原始数据写入 `{prefix}_telemetry`，分析结果写入 `{prefix}_analytics`。
//! 传输格式为 line protocol：`measurement,tag=v field=v timestamp_ns`。

use domain::{AnalyticsResult, MetricValue, TelemetryPoint, TelemetryValue};
use edge_storage::{BufferBatch, BufferPayload, RecordKind};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Float(f64),
    Bool(bool),
    String(String),
}

/// 单条待上传记录。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CloudRecord {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub ts_ms: i64,
}

impl CloudRecord {
    pub fn from_point(prefix: &str, point: &TelemetryPoint) -> Self {
        let mut tags = BTreeMap::new();
        for (key, value) in [
            ("enterprise", point.enterprise.as_str()),
            ("site", point.site.as_str()),
            ("area", point.area.as_str()),
            ("line", point.line.as_str()),
            ("machine", point.machine.as_str()),
            ("tag", point.tag.as_str()),
            ("quality", point.quality.as_str()),
        ] {
            tags.insert(key.to_string(), value.to_string());
        }
        if let Some(unit) = &point.unit {
            tags.insert("unit".to_string(), unit.clone());
        }
        let (name, value) = match &point.value {
            TelemetryValue::Float(value) => ("value_float", FieldValue::Float(*value)),
            TelemetryValue::Bool(value) => ("value_bool", FieldValue::Bool(*value)),
            TelemetryValue::String(value) => ("value_string", FieldValue::String(value.clone())),
        };
        let mut fields = BTreeMap::new();
        fields.insert(name.to_string(), value);
        Self {
            measurement: format!("{prefix}_telemetry"),
            tags,
            fields,
            ts_ms: point.ts_ms,
        }
    }

    pub fn from_analytics(prefix: &str, result: &AnalyticsResult) -> Self {
        let mut tags = BTreeMap::new();
        tags.insert("asset_id".to_string(), result.asset_id.clone());
        tags.insert(
            "analytics_type".to_string(),
            result.analytics_type.as_str().to_string(),
        );
        let mut fields = BTreeMap::new();
        for (name, value) in &result.metrics {
            let field = match value {
                MetricValue::Number(number) if number.is_finite() => FieldValue::Float(*number),
                MetricValue::Flag(flag) => FieldValue::Bool(*flag),
                MetricValue::Text(text) => FieldValue::String(text.clone()),
                _ => continue,
            };
            fields.insert(name.clone(), field);
        }
        if let Some(score) = result.score.filter(|score| score.is_finite()) {
            fields.insert("score".to_string(), FieldValue::Float(score));
        }
        if fields.is_empty() {
            fields.insert("insufficient_data".to_string(), FieldValue::Bool(true));
        }
        Self {
            measurement: format!("{prefix}_analytics"),
            tags,
            fields,
            ts_ms: result.ts_ms,
        }
    }

    /// 编码为单行 line protocol。
    pub fn to_line_protocol(&self) -> String {
        let mut line = escape(&self.measurement, &[',', ' ']);
        for (key, value) in &self.tags {
            if value.is_empty() {
                continue;
            }
            let _ = write!(
                line,
                ",{}={}",
                escape(key, &[',', '=', ' ']),
                escape(value, &[',', '=', ' '])
            );
        }
        let fields: Vec<String> = self
            .fields
            .iter()
            .map(|(key, value)| {
                let value = match value {
                    FieldValue::Float(number) => format!("{number:?}"),
                    FieldValue::Bool(flag) => flag.to_string(),
                    FieldValue::String(text) => format!("\"{}\"", escape(text, &['"'])),
                };
                format!("{}={}", escape(key, &[',', '=', ' ']), value)
            })
            .collect();
        let _ = write!(
            line,
            " {} {}",
            fields.join(","),
            self.ts_ms.saturating_mul(1_000_000)
        );
        line
    }
}

fn escape(raw: &str, special: &[char]) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch == '\\' || special.contains(&ch) {
            escaped.push('\\');
        }
        if ch == '\n' {
            escaped.push_str("\\n");
            continue;
        }
        escaped.push(ch);
    }
    escaped
}

/// 一个缓冲批次的上传视图。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadBatch {
    pub batch_id: String,
    pub kind: RecordKind,
    pub records: Vec<CloudRecord>,
}

impl UploadBatch {
    /// 按缓冲批次原有顺序编码。
    pub fn from_buffer(prefix: &str, batch: &BufferBatch) -> Self {
        let records = batch
            .records
            .iter()
            .map(|record| match &record.payload {
                BufferPayload::Telemetry(point) => CloudRecord::from_point(prefix, point),
                BufferPayload::Analytics(result) => CloudRecord::from_analytics(prefix, result),
            })
            .collect();
        Self {
            batch_id: batch.batch_id.clone(),
            kind: batch.kind,
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn to_line_protocol(&self) -> String {
        self.records
            .iter()
            .map(CloudRecord::to_line_protocol)
            .collect::<Vec<_>>()
            .join("\n")
    }
}
