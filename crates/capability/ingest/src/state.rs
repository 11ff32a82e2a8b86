//! 连接状态

use crate::session::SecurityPolicy;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    NegotiatingSecurity,
    Connected,
    ReconnectWait,
    /// 终止状态：策略耗尽或达到重试上限，需外部干预。
    Failed,
}

/// 对外暴露的连接健康度。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionHealth {
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionHealth::Connected => "connected",
            ConnectionHealth::Reconnecting => "reconnecting",
            ConnectionHealth::Failed => "failed",
        }
    }
}

impl ConnectionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionPhase::Disconnected => "disconnected",
            ConnectionPhase::Connecting => "connecting",
            ConnectionPhase::NegotiatingSecurity => "negotiating_security",
            ConnectionPhase::Connected => "connected",
            ConnectionPhase::ReconnectWait => "reconnect_wait",
            ConnectionPhase::Failed => "failed",
        }
    }

    pub fn health(&self) -> ConnectionHealth {
        match self {
            ConnectionPhase::Connected => ConnectionHealth::Connected,
            ConnectionPhase::Failed => ConnectionHealth::Failed,
            _ => ConnectionHealth::Reconnecting,
        }
    }
}

/// 单个端点的连接状态，仅由 ConnectionManager 修改。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionState {
    pub endpoint: String,
    pub phase: ConnectionPhase,
    pub security_policy: Option<SecurityPolicy>,
    pub attempt_count: u32,
    pub next_retry_at_ms: Option<i64>,
    pub connected_since_ms: Option<i64>,
    pub last_error: Option<String>,
}

impl ConnectionState {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            phase: ConnectionPhase::Disconnected,
            security_policy: None,
            attempt_count: 0,
            next_retry_at_ms: None,
            connected_since_ms: None,
            last_error: None,
        }
    }

    pub fn health(&self) -> ConnectionHealth {
        self.phase.health()
    }
}
