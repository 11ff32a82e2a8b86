//! 应用运行配置加载。
//!
//! 所有变量均有默认值；解析失败返回 [`ConfigError::Invalid`]，
//! 数值上的不合理取值（零间隔、越界抖动）由 [`AppConfig::sanitized`] 收敛。

use domain::AssetConfiguration;
use edge_ingest::SecurityPolicy;
use edge_storage::{EvictionOrder, EvictionPolicy, KindPreference};
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::path::Path;
use std::str::FromStr;

/// 配置加载错误。
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env: {0}")]
    Missing(String),
    #[error("invalid value for {0}: {1}")]
    Invalid(String, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferBackend {
    Sqlite,
    Memory,
}

impl FromStr for BufferBackend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(BufferBackend::Sqlite),
            "memory" => Ok(BufferBackend::Memory),
            other => Err(format!("unknown buffer backend: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudSinkKind {
    Mqtt,
    Noop,
}

impl FromStr for CloudSinkKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mqtt" => Ok(CloudSinkKind::Mqtt),
            "noop" => Ok(CloudSinkKind::Noop),
            other => Err(format!("unknown cloud sink: {other}")),
        }
    }
}

/// OPC UA 连接器实现。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorKind {
    OpcUa,
    Noop,
}

impl FromStr for ConnectorKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "opcua" | "opc-ua" => Ok(ConnectorKind::OpcUa),
            "noop" => Ok(ConnectorKind::Noop),
            other => Err(format!("unknown opc ua connector: {other}")),
        }
    }
}

/// 应用运行配置。
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub enterprise: String,
    pub assets_file: String,
    pub http_addr: String,
    pub buffer_backend: BufferBackend,
    pub buffer_path: String,
    pub buffer_max_mb: u64,
    pub buffer_retention_hours: u64,
    pub eviction: EvictionPolicy,
    pub cleanup_interval_secs: u64,
    pub upload_interval_secs: u64,
    pub upload_telemetry_batch: usize,
    pub upload_analytics_batch: usize,
    pub upload_timeout_ms: u64,
    pub upload_max_batches_per_cycle: usize,
    pub measurement_prefix: String,
    pub cloud_sink: CloudSinkKind,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_topic: String,
    pub mqtt_client_id: String,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub retry_jitter: f64,
    /// None 表示不限次数。
    pub retry_max_attempts: Option<u32>,
    pub stability_window_secs: u64,
    pub connection_timeout_secs: f64,
    /// 固定安全策略；设置后跳过协商。
    pub security_policy: Option<SecurityPolicy>,
    pub security_preference: Vec<SecurityPolicy>,
    /// 对所有资产生效的端点覆盖。
    pub server_url: Option<String>,
    pub connector: ConnectorKind,
    pub opcua_application_name: String,
    pub opcua_application_uri: String,
    pub opcua_pki_dir: String,
    pub opcua_trust_server_certs: bool,
    pub opcua_publishing_interval_ms: u64,
    pub analytics_tick_ms: u64,
    pub shutdown_grace_secs: u64,
    pub channel_capacity: usize,
}

impl AppConfig {
    /// 从环境变量读取配置。
    pub fn from_env() -> Result<Self, ConfigError> {
        let enterprise = read_string_with_default("EDGE_ENTERPRISE", "GlobalCorp");
        let assets_file = read_string_with_default("EDGE_ASSETS_FILE", "config/assets.json");
        let http_addr = read_string_with_default("EDGE_HTTP_ADDR", "127.0.0.1:8090");
        let buffer_backend = read_parsed_with_default("EDGE_BUFFER_BACKEND", BufferBackend::Sqlite)?;
        let buffer_path = read_string_with_default("EDGE_BUFFER_PATH", "data/edge_buffer.db");
        let buffer_max_mb = read_u64_with_default("EDGE_BUFFER_MAX_MB", 100)?;
        let buffer_retention_hours = read_u64_with_default("EDGE_BUFFER_RETENTION_HOURS", 24)?;
        let eviction = EvictionPolicy {
            order: read_parsed_with_default("EDGE_EVICTION_ORDER", EvictionOrder::ProcessedFirst)?,
            kind: read_parsed_with_default("EDGE_EVICTION_KIND", KindPreference::Oldest)?,
        };
        let cleanup_interval_secs = read_u64_with_default("EDGE_CLEANUP_INTERVAL_SECS", 300)?;

        let upload_interval_secs = read_u64_with_default("EDGE_UPLOAD_INTERVAL_SECS", 30)?;
        let upload_telemetry_batch = read_parsed_with_default("EDGE_UPLOAD_TELEMETRY_BATCH", 100)?;
        let upload_analytics_batch = read_parsed_with_default("EDGE_UPLOAD_ANALYTICS_BATCH", 50)?;
        let upload_timeout_ms = read_u64_with_default("EDGE_UPLOAD_TIMEOUT_MS", 10_000)?;
        let upload_max_batches_per_cycle =
            read_parsed_with_default("EDGE_UPLOAD_MAX_BATCHES_PER_CYCLE", 10)?;
        let measurement_prefix = read_string_with_default("EDGE_MEASUREMENT_PREFIX", "opcua");
        let cloud_sink = read_parsed_with_default("EDGE_CLOUD_SINK", CloudSinkKind::Mqtt)?;
        let mqtt_host = read_string_with_default("EDGE_MQTT_HOST", "127.0.0.1");
        let mqtt_port = read_parsed_with_default("EDGE_MQTT_PORT", 1883)?;
        let mqtt_username = read_optional("EDGE_MQTT_USERNAME");
        let mqtt_password = read_optional("EDGE_MQTT_PASSWORD");
        let mqtt_topic = read_string_with_default("EDGE_MQTT_TOPIC", "edge/uplink");
        let mqtt_client_id = read_string_with_default("EDGE_MQTT_CLIENT_ID", "edge-collector");

        let retry_base_ms = read_u64_with_default("EDGE_RETRY_BASE_MS", 1_000)?;
        let retry_max_ms = read_u64_with_default("EDGE_RETRY_MAX_MS", 30_000)?;
        let retry_jitter = read_parsed_with_default("EDGE_RETRY_JITTER", 0.25)?;
        let retry_max_attempts = read_optional_parsed("EDGE_RETRY_MAX_ATTEMPTS")?;
        let stability_window_secs = read_u64_with_default("EDGE_STABILITY_WINDOW_SECS", 60)?;
        let connection_timeout_secs = read_parsed_with_default("OPCUA_CONNECTION_TIMEOUT", 10.0)?;
        let security_policy = read_optional_parsed("OPCUA_SECURITY_POLICY")?;
        let security_preference = read_security_preference("EDGE_SECURITY_PREFERENCE")?;
        let server_url = read_optional("OPCUA_SERVER_URL");
        let connector = read_parsed_with_default("EDGE_OPCUA_CONNECTOR", ConnectorKind::OpcUa)?;
        let opcua_application_name =
            read_string_with_default("OPCUA_APPLICATION_NAME", "OPCUA-Edge-Collector-Client");
        let opcua_application_uri =
            read_string_with_default("OPCUA_APPLICATION_URI", "urn:edge-collector:client");
        let opcua_pki_dir = read_string_with_default("OPCUA_PKI_DIR", "pki");
        let opcua_trust_server_certs =
            read_parsed_with_default("OPCUA_TRUST_SERVER_CERTS", true)?;
        let opcua_publishing_interval_ms =
            read_u64_with_default("OPCUA_PUBLISHING_INTERVAL_MS", 1_000)?;

        let analytics_tick_ms = read_u64_with_default("EDGE_ANALYTICS_TICK_MS", 1_000)?;
        let shutdown_grace_secs = read_u64_with_default("EDGE_SHUTDOWN_GRACE_SECS", 10)?;
        let channel_capacity = read_parsed_with_default("EDGE_CHANNEL_CAPACITY", 1024)?;

        Ok(Self {
            enterprise,
            assets_file,
            http_addr,
            buffer_backend,
            buffer_path,
            buffer_max_mb,
            buffer_retention_hours,
            eviction,
            cleanup_interval_secs,
            upload_interval_secs,
            upload_telemetry_batch,
            upload_analytics_batch,
            upload_timeout_ms,
            upload_max_batches_per_cycle,
            measurement_prefix,
            cloud_sink,
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_topic,
            mqtt_client_id,
            retry_base_ms,
            retry_max_ms,
            retry_jitter,
            retry_max_attempts,
            stability_window_secs,
            connection_timeout_secs,
            security_policy,
            security_preference,
            server_url,
            connector,
            opcua_application_name,
            opcua_application_uri,
            opcua_pki_dir,
            opcua_trust_server_certs,
            opcua_publishing_interval_ms,
            analytics_tick_ms,
            shutdown_grace_secs,
            channel_capacity,
        }
        .sanitized())
    }

    /// 收敛不合理取值。
    pub fn sanitized(mut self) -> Self {
        self.buffer_max_mb = self.buffer_max_mb.max(1);
        self.cleanup_interval_secs = self.cleanup_interval_secs.max(1);
        self.upload_interval_secs = self.upload_interval_secs.max(1);
        self.upload_telemetry_batch = self.upload_telemetry_batch.max(1);
        self.upload_analytics_batch = self.upload_analytics_batch.max(1);
        self.upload_max_batches_per_cycle = self.upload_max_batches_per_cycle.max(1);
        if self.upload_timeout_ms == 0 {
            self.upload_timeout_ms = 10_000;
        }
        self.retry_base_ms = self.retry_base_ms.max(1);
        self.retry_max_ms = self.retry_max_ms.max(self.retry_base_ms);
        self.retry_jitter = if self.retry_jitter.is_finite() {
            self.retry_jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if !self.connection_timeout_secs.is_finite() || self.connection_timeout_secs <= 0.0 {
            self.connection_timeout_secs = 10.0;
        }
        if self.security_preference.is_empty() {
            self.security_preference = SecurityPolicy::strongest_first();
        }
        self.opcua_publishing_interval_ms = self.opcua_publishing_interval_ms.max(50);
        self.analytics_tick_ms = self.analytics_tick_ms.max(10);
        self.channel_capacity = self.channel_capacity.max(1);
        if self.measurement_prefix.trim().is_empty() {
            self.measurement_prefix = "opcua".to_string();
        }
        self
    }

    /// 读取资产清单并应用端点与节点 ID 覆盖。
    pub fn load_assets(&self) -> Result<Vec<AssetConfiguration>, ConfigError> {
        let assets = read_assets_file(Path::new(&self.assets_file))?;
        Ok(apply_overrides(assets, self.server_url.as_deref(), |key| {
            read_optional(key)
        }))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AssetsDocument {
    List(Vec<AssetConfiguration>),
    Wrapped { assets: Vec<AssetConfiguration> },
}

/// 解析资产清单文件：JSON 数组或 `{"assets": [...]}`；资产名不可重复。
pub fn read_assets_file(path: &Path) -> Result<Vec<AssetConfiguration>, ConfigError> {
    let invalid = |reason: String| ConfigError::Invalid("EDGE_ASSETS_FILE".to_string(), reason);
    let raw = std::fs::read_to_string(path)
        .map_err(|err| invalid(format!("{}: {err}", path.display())))?;
    let assets = match serde_json::from_str::<AssetsDocument>(&raw)
        .map_err(|err| invalid(format!("{}: {err}", path.display())))?
    {
        AssetsDocument::List(assets) => assets,
        AssetsDocument::Wrapped { assets } => assets,
    };
    let mut seen = HashSet::new();
    for asset in &assets {
        if asset.asset_name.trim().is_empty() {
            return Err(invalid("asset_name must not be empty".to_string()));
        }
        if !seen.insert(asset.asset_name.as_str()) {
            return Err(invalid(format!("duplicate asset: {}", asset.asset_name)));
        }
    }
    Ok(assets)
}

/// 节点覆盖变量名：`NODE_ID_<ASSET>_<TAG>`，大写，非字母数字替换为 `_`。
pub fn node_override_key(asset_name: &str, tag: &str) -> String {
    let normalize = |raw: &str| -> String {
        raw.chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() {
                    ch.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect()
    };
    format!("NODE_ID_{}_{}", normalize(asset_name), normalize(tag))
}

/// 应用覆盖；`lookup` 以变量名查询覆盖值。
pub fn apply_overrides(
    assets: Vec<AssetConfiguration>,
    server_url: Option<&str>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Vec<AssetConfiguration> {
    assets
        .into_iter()
        .map(|asset| {
            let name = asset.asset_name.clone();
            asset.with_overrides(server_url, |tag| lookup(&node_override_key(&name, tag)))
        })
        .collect()
}

fn read_string_with_default(key: &str, default: &str) -> String {
    read_optional(key).unwrap_or_else(|| default.to_string())
}

fn read_u64_with_default(key: &str, default: u64) -> Result<u64, ConfigError> {
    read_parsed_with_default(key, default)
}

fn read_parsed_with_default<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    Ok(read_optional_parsed(key)?.unwrap_or(default))
}

fn read_optional_parsed<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match read_optional(key) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(key.to_string(), value)),
        None => Ok(None),
    }
}

fn read_optional(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

fn read_security_preference(key: &str) -> Result<Vec<SecurityPolicy>, ConfigError> {
    let Some(raw) = read_optional(key) else {
        return Ok(SecurityPolicy::strongest_first());
    };
    let mut policies = Vec::new();
    for item in raw.split(',').map(str::trim).filter(|item| !item.is_empty()) {
        let policy = item
            .parse::<SecurityPolicy>()
            .map_err(|_| ConfigError::Invalid(key.to_string(), raw.clone()))?;
        if !policies.contains(&policy) {
            policies.push(policy);
        }
    }
    Ok(policies)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_key_normalizes_names() {
        assert_eq!(
            node_override_key("Press_01", "cycle-time"),
            "NODE_ID_PRESS_01_CYCLE_TIME"
        );
        assert_eq!(node_override_key("line a", "temp"), "NODE_ID_LINE_A_TEMP");
    }

    #[test]
    fn backend_and_sink_parse_case_insensitively() {
        assert_eq!("SQLite".parse::<BufferBackend>(), Ok(BufferBackend::Sqlite));
        assert_eq!(" memory ".parse::<BufferBackend>(), Ok(BufferBackend::Memory));
        assert_eq!("NOOP".parse::<CloudSinkKind>(), Ok(CloudSinkKind::Noop));
        assert!("kafka".parse::<CloudSinkKind>().is_err());
        assert_eq!("OPCUA".parse::<ConnectorKind>(), Ok(ConnectorKind::OpcUa));
        assert_eq!("noop".parse::<ConnectorKind>(), Ok(ConnectorKind::Noop));
        assert!("modbus".parse::<ConnectorKind>().is_err());
    }
}
