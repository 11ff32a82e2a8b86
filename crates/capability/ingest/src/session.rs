//! OPC UA 能力边界
//!
//! 协议与会话本身由外部实现提供，这里只约定连接、订阅、读写三类能力。

use crate::error::{ConnectError, SessionError};
use async_trait::async_trait;
use domain::{Quality, TelemetryValue};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;

/// 安全策略（由强到弱）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecurityPolicy {
    Basic256Sha256,
    Basic128Rsa15,
    None,
}

impl SecurityPolicy {
    /// 默认协商顺序：强者优先。
    pub fn strongest_first() -> Vec<SecurityPolicy> {
        vec![
            SecurityPolicy::Basic256Sha256,
            SecurityPolicy::Basic128Rsa15,
            SecurityPolicy::None,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityPolicy::Basic256Sha256 => "Basic256Sha256",
            SecurityPolicy::Basic128Rsa15 => "Basic128Rsa15",
            SecurityPolicy::None => "None",
        }
    }

    /// 端点描述中使用的策略 URI。
    pub fn uri(&self) -> &'static str {
        match self {
            SecurityPolicy::Basic256Sha256 => {
                "http://opcfoundation.org/UA/SecurityPolicy#Basic256Sha256"
            }
            SecurityPolicy::Basic128Rsa15 => {
                "http://opcfoundation.org/UA/SecurityPolicy#Basic128Rsa15"
            }
            SecurityPolicy::None => "http://opcfoundation.org/UA/SecurityPolicy#None",
        }
    }

    /// 非 None 策略一律签名并加密。
    pub fn encrypts(&self) -> bool {
        !matches!(self, SecurityPolicy::None)
    }
}

impl fmt::Display for SecurityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecurityPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "basic256sha256" => Ok(SecurityPolicy::Basic256Sha256),
            "basic128rsa15" => Ok(SecurityPolicy::Basic128Rsa15),
            "none" => Ok(SecurityPolicy::None),
            other => Err(format!("unknown security policy: {other}")),
        }
    }
}

/// 订阅回调中的一次数值变化。
#[derive(Debug, Clone, PartialEq)]
pub struct DataChange {
    pub node_id: String,
    pub value: TelemetryValue,
    pub quality: Quality,
    /// 源时间戳（毫秒），缺失时使用接收时间。
    pub source_ts_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    DataChange(DataChange),
    /// 保活或订阅失败，会话视为已断开。
    KeepAliveFailed(String),
}

/// 已建立的会话。
#[async_trait]
pub trait OpcUaSession: Send + Sync {
    async fn subscribe(
        &self,
        node_ids: &[String],
    ) -> Result<mpsc::Receiver<SessionEvent>, SessionError>;
    async fn read(&self, node_id: &str) -> Result<TelemetryValue, SessionError>;
    async fn write(&self, node_id: &str, value: TelemetryValue) -> Result<(), SessionError>;
    async fn disconnect(&self);
}

/// 会话工厂。
#[async_trait]
pub trait OpcUaConnector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &str,
        policy: SecurityPolicy,
        timeout: Duration,
    ) -> Result<Box<dyn OpcUaSession>, ConnectError>;
}

/// 占位连接器：始终返回瞬时错误，用于离线调试（`EDGE_OPCUA_CONNECTOR=noop`）。
#[derive(Debug, Default)]
pub struct NoopConnector;

#[async_trait]
impl OpcUaConnector for NoopConnector {
    async fn connect(
        &self,
        endpoint: &str,
        _policy: SecurityPolicy,
        _timeout: Duration,
    ) -> Result<Box<dyn OpcUaSession>, ConnectError> {
        Err(ConnectError::Transient(format!(
            "no opc ua client configured for {endpoint}"
        )))
    }
}
