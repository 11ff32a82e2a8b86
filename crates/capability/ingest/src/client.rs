//! 基于 async-opcua 的连接器实现
//!
//! 每次 `connect` 构建独立客户端并在端点列表中匹配所需安全策略；
//! 会话事件循环结束（保活失败、通道断开）时向订阅者发送 [`SessionEvent::KeepAliveFailed`]。
//! 重连由 [`crate::ConnectionManager`] 负责，客户端自身不重试。

use crate::error::{ConnectError, SessionError};
use crate::session::{DataChange, OpcUaConnector, OpcUaSession, SecurityPolicy, SessionEvent};
use async_trait::async_trait;
use domain::{Quality, TelemetryValue};
use opcua::client::{ClientBuilder, DataChangeCallback, IdentityToken, MonitoredItem, Session};
use opcua::types::{
    AttributeId, DataValue, MessageSecurityMode, MonitoredItemCreateRequest, NodeId, ReadValueId,
    StatusCode, TimestampsToReturn, UserTokenPolicy, Variant, WriteValue,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// 视为安全协商失败的状态码名称片段。
const SECURITY_MARKERS: [&str; 4] = [
    "Security",
    "Certificate",
    "NoMatchingEndpoint",
    "EndpointUrlInvalid",
];

/// 客户端应用标识与订阅参数。
#[derive(Debug, Clone)]
pub struct UaClientSettings {
    pub application_name: String,
    pub application_uri: String,
    /// 客户端证书与信任列表目录；证书缺失时自动生成。
    pub pki_dir: PathBuf,
    pub trust_server_certs: bool,
    pub publishing_interval: Duration,
    pub event_capacity: usize,
}

impl Default for UaClientSettings {
    fn default() -> Self {
        Self {
            application_name: "OPCUA-Edge-Collector-Client".to_string(),
            application_uri: "urn:edge-collector:client".to_string(),
            pki_dir: PathBuf::from("pki"),
            trust_server_certs: true,
            publishing_interval: Duration::from_secs(1),
            event_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UaConnector {
    settings: UaClientSettings,
}

impl UaConnector {
    pub fn new(settings: UaClientSettings) -> Self {
        Self { settings }
    }

    async fn open(
        &self,
        endpoint: &str,
        policy: SecurityPolicy,
    ) -> Result<(Arc<Session>, tokio::task::JoinHandle<StatusCode>), ConnectError> {
        let settings = &self.settings;
        let mut client = ClientBuilder::new()
            .application_name(settings.application_name.as_str())
            .application_uri(settings.application_uri.as_str())
            .product_uri(settings.application_uri.as_str())
            .pki_dir(settings.pki_dir.clone())
            .create_sample_keypair(true)
            .trust_server_certs(settings.trust_server_certs)
            .session_retry_limit(0)
            .client()
            .map_err(|err| ConnectError::Transient(format!("client config: {err:?}")))?;

        let (session, event_loop) = client
            .connect_to_matching_endpoint(
                (
                    endpoint,
                    policy.uri(),
                    security_mode(policy),
                    UserTokenPolicy::anonymous(),
                ),
                IdentityToken::Anonymous,
            )
            .await
            .map_err(|err| classify_failure(&format!("{err:?}")))?;
        let handle = event_loop.spawn();
        if !session.wait_for_connection().await {
            let status = match handle.await {
                Ok(status) => format!("{status:?}"),
                Err(err) => err.to_string(),
            };
            return Err(classify_failure(&status));
        }
        Ok((session, handle))
    }
}

#[async_trait]
impl OpcUaConnector for UaConnector {
    async fn connect(
        &self,
        endpoint: &str,
        policy: SecurityPolicy,
        timeout: Duration,
    ) -> Result<Box<dyn OpcUaSession>, ConnectError> {
        let (session, handle) = tokio::time::timeout(timeout, self.open(endpoint, policy))
            .await
            .map_err(|_| ConnectError::Timeout(timeout.as_millis() as u64))??;

        let loop_abort = handle.abort_handle();
        let (closed_tx, closed_rx) = watch::channel(None);
        tokio::spawn(async move {
            let reason = match handle.await {
                Ok(status) => format!("session event loop ended: {status:?}"),
                Err(err) => format!("session event loop aborted: {err}"),
            };
            let _ = closed_tx.send(Some(reason));
        });
        info!(
            target: "edge.ingest",
            endpoint = %endpoint,
            security_policy = policy.as_str(),
            "opcua_session_opened"
        );
        Ok(Box::new(UaSession {
            session,
            publishing_interval: self.settings.publishing_interval,
            event_capacity: self.settings.event_capacity.max(1),
            closed: closed_rx,
            loop_abort,
        }))
    }
}

pub struct UaSession {
    session: Arc<Session>,
    publishing_interval: Duration,
    event_capacity: usize,
    /// 事件循环结束原因；None 表示仍在运行。
    closed: watch::Receiver<Option<String>>,
    loop_abort: AbortHandle,
}

impl UaSession {
    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.closed.borrow().is_some() {
            return Err(SessionError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl OpcUaSession for UaSession {
    async fn subscribe(
        &self,
        node_ids: &[String],
    ) -> Result<mpsc::Receiver<SessionEvent>, SessionError> {
        self.ensure_open()?;
        let mut by_node = HashMap::with_capacity(node_ids.len());
        for raw in node_ids {
            let node = parse_node_id(raw).map_err(SessionError::Subscribe)?;
            by_node.insert(node, raw.clone());
        }
        let requests: Vec<MonitoredItemCreateRequest> =
            by_node.keys().cloned().map(Into::into).collect();

        let (tx, rx) = mpsc::channel(self.event_capacity);
        let changes = tx.clone();
        let callback = DataChangeCallback::new(move |value: DataValue, item: &MonitoredItem| {
            let node = &item.item_to_monitor().node_id;
            let Some(node_id) = by_node.get(node) else {
                debug!(target: "edge.ingest", node_id = %node, "data_change_unknown_node");
                return;
            };
            let Some(change) = data_change(node_id, &value) else {
                debug!(target: "edge.ingest", node_id = %node_id, "data_change_unsupported_value");
                return;
            };
            // 回调不可 await；通道满时丢弃并记录
            if let Err(err) = changes.try_send(SessionEvent::DataChange(change)) {
                warn!(target: "edge.ingest", node_id = %node_id, error = %err, "data_change_dropped");
            }
        });

        let subscription_id = self
            .session
            .create_subscription(self.publishing_interval, 10, 30, 0, 0, true, callback)
            .await
            .map_err(|err| SessionError::Subscribe(format!("{err:?}")))?;
        let created = self
            .session
            .create_monitored_items(subscription_id, TimestampsToReturn::Both, requests)
            .await
            .map_err(|err| SessionError::Subscribe(format!("{err:?}")))?;
        debug!(
            target: "edge.ingest",
            subscription_id,
            monitored_items = created.len(),
            "opcua_monitored_items_created"
        );

        let mut closed = self.closed.clone();
        tokio::spawn(async move {
            let reason = loop {
                if let Some(reason) = closed.borrow_and_update().clone() {
                    break reason;
                }
                if closed.changed().await.is_err() {
                    break "session dropped".to_string();
                }
            };
            let _ = tx.send(SessionEvent::KeepAliveFailed(reason)).await;
        });
        Ok(rx)
    }

    async fn read(&self, node_id: &str) -> Result<TelemetryValue, SessionError> {
        self.ensure_open()?;
        let node = parse_node_id(node_id).map_err(SessionError::Read)?;
        let values = self
            .session
            .read(&[ReadValueId::from(node)], TimestampsToReturn::Neither, 0.0)
            .await
            .map_err(|err| SessionError::Read(format!("{err:?}")))?;
        let value = values
            .into_iter()
            .next()
            .ok_or_else(|| SessionError::Read(format!("no value returned for {node_id}")))?;
        if let Some(status) = value.status
            && status.is_bad()
        {
            return Err(SessionError::Read(format!("{node_id}: {status:?}")));
        }
        value
            .value
            .as_ref()
            .and_then(telemetry_value)
            .ok_or_else(|| SessionError::Read(format!("{node_id}: unsupported value type")))
    }

    async fn write(&self, node_id: &str, value: TelemetryValue) -> Result<(), SessionError> {
        self.ensure_open()?;
        let node = parse_node_id(node_id).map_err(SessionError::Write)?;
        let request = WriteValue {
            node_id: node,
            attribute_id: AttributeId::Value as u32,
            value: DataValue::value_only(variant(value)),
            ..Default::default()
        };
        let statuses = self
            .session
            .write(&[request])
            .await
            .map_err(|err| SessionError::Write(format!("{err:?}")))?;
        match statuses.first() {
            Some(status) if status.is_good() => Ok(()),
            Some(status) => Err(SessionError::Write(format!("{node_id}: {status:?}"))),
            None => Err(SessionError::Write(format!("no status returned for {node_id}"))),
        }
    }

    async fn disconnect(&self) {
        if let Err(err) = self.session.disconnect().await {
            debug!(target: "edge.ingest", error = ?err, "opcua_disconnect_failed");
        }
        self.loop_abort.abort();
    }
}

impl Drop for UaSession {
    fn drop(&mut self) {
        self.loop_abort.abort();
    }
}

fn security_mode(policy: SecurityPolicy) -> MessageSecurityMode {
    if policy.encrypts() {
        MessageSecurityMode::SignAndEncrypt
    } else {
        MessageSecurityMode::None
    }
}

/// 按状态码名称区分安全拒绝（可回退策略）与瞬时错误。
fn classify_failure(status: &str) -> ConnectError {
    if SECURITY_MARKERS.iter().any(|marker| status.contains(marker)) {
        ConnectError::SecurityRejected(status.to_string())
    } else {
        ConnectError::Transient(status.to_string())
    }
}

fn parse_node_id(raw: &str) -> Result<NodeId, String> {
    NodeId::from_str(raw.trim()).map_err(|_| format!("invalid node id: {raw}"))
}

/// 缺省状态码按 Good 处理。
fn quality(status: Option<StatusCode>) -> Quality {
    match status {
        None => Quality::Good,
        Some(status) if status.is_good() => Quality::Good,
        Some(status) if status.is_uncertain() => Quality::Uncertain,
        Some(_) => Quality::Bad,
    }
}

fn telemetry_value(variant: &Variant) -> Option<TelemetryValue> {
    let value = match variant {
        Variant::Boolean(value) => TelemetryValue::Bool(*value),
        Variant::SByte(value) => TelemetryValue::Float(f64::from(*value)),
        Variant::Byte(value) => TelemetryValue::Float(f64::from(*value)),
        Variant::Int16(value) => TelemetryValue::Float(f64::from(*value)),
        Variant::UInt16(value) => TelemetryValue::Float(f64::from(*value)),
        Variant::Int32(value) => TelemetryValue::Float(f64::from(*value)),
        Variant::UInt32(value) => TelemetryValue::Float(f64::from(*value)),
        Variant::Int64(value) => TelemetryValue::Float(*value as f64),
        Variant::UInt64(value) => TelemetryValue::Float(*value as f64),
        Variant::Float(value) => TelemetryValue::Float(f64::from(*value)),
        Variant::Double(value) => TelemetryValue::Float(*value),
        Variant::String(value) => TelemetryValue::String(value.value().clone().unwrap_or_default()),
        _ => return None,
    };
    Some(value)
}

fn variant(value: TelemetryValue) -> Variant {
    match value {
        TelemetryValue::Bool(value) => Variant::Boolean(value),
        TelemetryValue::Float(value) => Variant::Double(value),
        TelemetryValue::String(value) => Variant::from(value),
    }
}

fn data_change(node_id: &str, value: &DataValue) -> Option<DataChange> {
    let telemetry = value.value.as_ref().and_then(telemetry_value)?;
    Some(DataChange {
        node_id: node_id.to_string(),
        value: telemetry,
        quality: quality(value.status),
        source_ts_ms: value
            .source_timestamp
            .as_ref()
            .map(|ts| ts.as_chrono().timestamp_millis()),
    })
}
