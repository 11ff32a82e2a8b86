//! 连接生命周期管理
//!
//! ```text
//! disconnected → connecting → negotiating_security → connected
//!                    ▲                                   │ 断开
//!                    └────────── reconnect_wait ◄────────┘
//! ```
//!
//! 策略全部被拒绝或达到重试上限时进入 `failed`，任务退出。

use crate::backoff::BackoffPolicy;
use crate::error::ConnectError;
use crate::session::{DataChange, OpcUaConnector, OpcUaSession, SecurityPolicy, SessionEvent};
use crate::state::{ConnectionPhase, ConnectionState};
use domain::{AssetConfiguration, TelemetryPoint, now_epoch_ms};
use edge_telemetry::{record_point_received, record_point_skipped, record_reconnect_attempt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// 连接参数。
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub enterprise: String,
    /// 固定策略，设置后跳过协商。
    pub security_override: Option<SecurityPolicy>,
    pub security_preference: Vec<SecurityPolicy>,
    pub connect_timeout: Duration,
    pub backoff: BackoffPolicy,
    /// None 表示无限重试。
    pub max_attempts: Option<u32>,
    /// 连接持续该时长后重置重试计数。
    pub stability_window: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            enterprise: "GlobalCorp".to_string(),
            security_override: None,
            security_preference: SecurityPolicy::strongest_first(),
            connect_timeout: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
            max_attempts: None,
            stability_window: Duration::from_secs(60),
        }
    }
}

impl ConnectionSettings {
    /// 本次连接需尝试的策略顺序。
    pub fn policies(&self) -> Vec<SecurityPolicy> {
        match self.security_override {
            Some(policy) => vec![policy],
            None if self.security_preference.is_empty() => SecurityPolicy::strongest_first(),
            None => self.security_preference.clone(),
        }
    }
}

enum Establish {
    Session(Box<dyn OpcUaSession>, SecurityPolicy),
    Transient(String),
    Exhausted(String),
    Shutdown,
}

enum StreamEnd {
    Lost(String),
    Shutdown,
}

/// 等待停机信号；发送端被丢弃同样视为停机。
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// 单个资产端点的连接管理器。
pub struct ConnectionManager {
    asset: Arc<AssetConfiguration>,
    settings: ConnectionSettings,
    connector: Arc<dyn OpcUaConnector>,
    state: watch::Sender<ConnectionState>,
}

impl ConnectionManager {
    pub fn new(
        asset: Arc<AssetConfiguration>,
        settings: ConnectionSettings,
        connector: Arc<dyn OpcUaConnector>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::new(asset.endpoint.clone()));
        Self {
            asset,
            settings,
            connector,
            state,
        }
    }

    pub fn asset_id(&self) -> &str {
        &self.asset.asset_name
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn update(&self, apply: impl FnOnce(&mut ConnectionState)) {
        self.state.send_modify(apply);
    }

    fn finish(&self, phase: ConnectionPhase) -> ConnectionPhase {
        self.update(|state| {
            state.phase = phase;
            state.next_retry_at_ms = None;
            state.connected_since_ms = None;
        });
        phase
    }

    /// 运行连接循环直至停机或进入终止状态，返回最终阶段。
    ///
    /// 采集点按到达顺序写入 `points`；通道满时等待（背压），期间仍响应停机。
    pub async fn run(
        &self,
        points: mpsc::Sender<TelemetryPoint>,
        mut shutdown: watch::Receiver<bool>,
    ) -> ConnectionPhase {
        let asset_id = self.asset_id().to_string();
        let mut attempt: u32 = 0;
        loop {
            if *shutdown.borrow() {
                return self.finish(ConnectionPhase::Disconnected);
            }
            self.update(|state| {
                state.phase = ConnectionPhase::Connecting;
                state.attempt_count = attempt;
                state.next_retry_at_ms = None;
            });

            match self.establish(&mut shutdown).await {
                Establish::Session(session, policy) => {
                    let connected_at = Instant::now();
                    self.update(|state| {
                        state.phase = ConnectionPhase::Connected;
                        state.security_policy = Some(policy);
                        state.connected_since_ms = Some(now_epoch_ms());
                        state.last_error = None;
                    });
                    info!(
                        target: "edge.ingest",
                        asset_id = %asset_id,
                        endpoint = %self.asset.endpoint,
                        security_policy = %policy,
                        attempt,
                        "opcua_connected"
                    );
                    let end = self.stream(session.as_ref(), &points, &mut shutdown).await;
                    session.disconnect().await;
                    match end {
                        StreamEnd::Shutdown => {
                            info!(target: "edge.ingest", asset_id = %asset_id, "opcua_disconnected");
                            return self.finish(ConnectionPhase::Disconnected);
                        }
                        StreamEnd::Lost(reason) => {
                            if connected_at.elapsed() >= self.settings.stability_window {
                                attempt = 0;
                            }
                            warn!(
                                target: "edge.ingest",
                                asset_id = %asset_id,
                                reason = %reason,
                                "opcua_connection_lost"
                            );
                            self.update(|state| {
                                state.connected_since_ms = None;
                                state.last_error = Some(reason);
                            });
                        }
                    }
                }
                Establish::Transient(reason) => {
                    warn!(
                        target: "edge.ingest",
                        asset_id = %asset_id,
                        attempt,
                        reason = %reason,
                        "opcua_connect_failed"
                    );
                    self.update(|state| state.last_error = Some(reason));
                }
                Establish::Exhausted(reason) => {
                    error!(
                        target: "edge.ingest",
                        asset_id = %asset_id,
                        reason = %reason,
                        "security_policies_exhausted"
                    );
                    self.update(|state| state.last_error = Some(reason));
                    return self.finish(ConnectionPhase::Failed);
                }
                Establish::Shutdown => return self.finish(ConnectionPhase::Disconnected),
            }

            if self.settings.max_attempts.is_some_and(|max| attempt >= max) {
                error!(
                    target: "edge.ingest",
                    asset_id = %asset_id,
                    attempts = attempt,
                    "opcua_retry_limit_reached"
                );
                return self.finish(ConnectionPhase::Failed);
            }

            let delay = self.settings.backoff.jittered_delay(attempt);
            attempt = attempt.saturating_add(1);
            record_reconnect_attempt();
            let next_retry_at_ms = now_epoch_ms() + delay.as_millis() as i64;
            self.update(|state| {
                state.phase = ConnectionPhase::ReconnectWait;
                state.attempt_count = attempt;
                state.next_retry_at_ms = Some(next_retry_at_ms);
            });
            info!(
                target: "edge.ingest",
                asset_id = %asset_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "reconnect_scheduled"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_shutdown(&mut shutdown) => {
                    return self.finish(ConnectionPhase::Disconnected);
                }
            }
        }
    }

    /// 按顺序尝试安全策略：被拒绝则回退，瞬时错误直接进入重连。
    async fn establish(&self, shutdown: &mut watch::Receiver<bool>) -> Establish {
        let timeout = self.settings.connect_timeout;
        let mut rejected = Vec::new();
        for policy in self.settings.policies() {
            self.update(|state| {
                state.phase = ConnectionPhase::NegotiatingSecurity;
                state.security_policy = Some(policy);
            });
            let connect = tokio::time::timeout(
                timeout,
                self.connector.connect(&self.asset.endpoint, policy, timeout),
            );
            let outcome = tokio::select! {
                result = connect => result
                    .unwrap_or_else(|_| Err(ConnectError::Timeout(timeout.as_millis() as u64))),
                _ = wait_for_shutdown(shutdown) => return Establish::Shutdown,
            };
            match outcome {
                Ok(session) => return Establish::Session(session, policy),
                Err(ConnectError::SecurityRejected(reason)) => {
                    warn!(
                        target: "edge.ingest",
                        asset_id = %self.asset_id(),
                        security_policy = %policy,
                        reason = %reason,
                        "security_policy_rejected"
                    );
                    rejected.push(format!("{policy}: {reason}"));
                }
                Err(err) => return Establish::Transient(err.to_string()),
            }
        }
        Establish::Exhausted(format!("all security policies rejected ({})", rejected.join("; ")))
    }

    async fn stream(
        &self,
        session: &dyn OpcUaSession,
        points: &mpsc::Sender<TelemetryPoint>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> StreamEnd {
        let node_ids: Vec<String> = self.asset.node_mapping.values().cloned().collect();
        let subscribed = tokio::select! {
            result = tokio::time::timeout(self.settings.connect_timeout, session.subscribe(&node_ids)) => result,
            _ = wait_for_shutdown(shutdown) => return StreamEnd::Shutdown,
        };
        let mut events = match subscribed {
            Ok(Ok(events)) => events,
            Ok(Err(err)) => return StreamEnd::Lost(err.to_string()),
            Err(_) => return StreamEnd::Lost("subscribe timed out".to_string()),
        };
        debug!(
            target: "edge.ingest",
            asset_id = %self.asset_id(),
            nodes = node_ids.len(),
            "opcua_subscribed"
        );

        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = wait_for_shutdown(shutdown) => return StreamEnd::Shutdown,
            };
            let change = match event {
                Some(SessionEvent::DataChange(change)) => change,
                Some(SessionEvent::KeepAliveFailed(reason)) => return StreamEnd::Lost(reason),
                None => return StreamEnd::Lost("subscription closed".to_string()),
            };
            let Some(point) = self.to_point(change) else {
                continue;
            };
            tokio::select! {
                sent = points.send(point) => {
                    if sent.is_err() {
                        warn!(target: "edge.ingest", asset_id = %self.asset_id(), "point_channel_closed");
                        return StreamEnd::Shutdown;
                    }
                }
                _ = wait_for_shutdown(shutdown) => return StreamEnd::Shutdown,
            }
        }
    }

    fn to_point(&self, change: DataChange) -> Option<TelemetryPoint> {
        record_point_received();
        let Some(tag) = self.asset.tag_for_node(&change.node_id) else {
            record_point_skipped();
            debug!(
                target: "edge.ingest",
                asset_id = %self.asset_id(),
                node_id = %change.node_id,
                "unmapped_node_dropped"
            );
            return None;
        };
        let ts_ms = change.source_ts_ms.unwrap_or_else(now_epoch_ms);
        Some(self.asset.point(
            &self.settings.enterprise,
            tag,
            change.value,
            change.quality,
            ts_ms,
        ))
    }
}
