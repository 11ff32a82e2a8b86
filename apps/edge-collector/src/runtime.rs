//! 运行时装配
//!
//! 将配置转换为各组件参数，并为每个资产启动「连接管理器 → 有界通道 → 分析/缓冲 worker」
//! 两个任务；另有上传循环与缓冲清理循环。所有任务共用同一个停机 `watch` 信号。

use domain::{AssetConfiguration, now_epoch_ms};
use edge_analytics::AnalyticsEngine;
use edge_config::{AppConfig, BufferBackend, CloudSinkKind, ConnectorKind};
use edge_ingest::{
    BackoffPolicy, ConnectionManager, ConnectionPhase, ConnectionSettings, NoopConnector,
    OpcUaConnector, UaClientSettings, UaConnector, wait_for_shutdown,
};
use edge_pipeline::{AssetPipeline, PipelineConfig};
use edge_storage::{BufferError, BufferOptions, InMemoryBuffer, LocalBuffer, SqliteBuffer};
use edge_telemetry::record_retention_deleted;
use edge_upload::{CloudSink, MqttCloudSink, MqttSinkConfig, NoopSink, UploadConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::state::AssetHandle;

pub fn buffer_options(config: &AppConfig) -> BufferOptions {
    BufferOptions {
        max_size_mb: config.buffer_max_mb,
        eviction: config.eviction,
    }
}

/// 打开本地缓冲；SQLite 打开时按现有记录重新计算占用。
pub async fn open_buffer(config: &AppConfig) -> Result<Arc<dyn LocalBuffer>, BufferError> {
    let options = buffer_options(config);
    let buffer: Arc<dyn LocalBuffer> = match config.buffer_backend {
        BufferBackend::Sqlite => Arc::new(SqliteBuffer::open(&config.buffer_path, options).await?),
        BufferBackend::Memory => {
            warn!(target: "edge.buffer", "memory_buffer_selected_not_durable");
            Arc::new(InMemoryBuffer::new(options))
        }
    };
    let status = buffer.get_buffer_status().await?;
    info!(
        target: "edge.buffer",
        backend = ?config.buffer_backend,
        pending = status.pending(),
        size_mb = status.size_mb,
        max_size_mb = status.max_size_mb,
        "buffer_opened"
    );
    Ok(buffer)
}

pub fn connection_settings(config: &AppConfig) -> ConnectionSettings {
    ConnectionSettings {
        enterprise: config.enterprise.clone(),
        security_override: config.security_policy,
        security_preference: config.security_preference.clone(),
        connect_timeout: Duration::from_secs_f64(config.connection_timeout_secs),
        backoff: BackoffPolicy::new(
            Duration::from_millis(config.retry_base_ms),
            Duration::from_millis(config.retry_max_ms),
            config.retry_jitter,
        ),
        max_attempts: config.retry_max_attempts,
        stability_window: Duration::from_secs(config.stability_window_secs),
    }
}

pub fn client_settings(config: &AppConfig) -> UaClientSettings {
    UaClientSettings {
        application_name: config.opcua_application_name.clone(),
        application_uri: config.opcua_application_uri.clone(),
        pki_dir: config.opcua_pki_dir.clone().into(),
        trust_server_certs: config.opcua_trust_server_certs,
        publishing_interval: Duration::from_millis(config.opcua_publishing_interval_ms),
        event_capacity: config.channel_capacity,
    }
}

pub fn build_connector(config: &AppConfig) -> Arc<dyn OpcUaConnector> {
    match config.connector {
        ConnectorKind::OpcUa => {
            let settings = client_settings(config);
            info!(
                target: "edge.ingest",
                application_uri = %settings.application_uri,
                pki_dir = %settings.pki_dir.display(),
                "opcua_connector_ready"
            );
            Arc::new(UaConnector::new(settings))
        }
        ConnectorKind::Noop => {
            warn!(target: "edge.ingest", "opcua_connector_noop_never_connects");
            Arc::new(NoopConnector)
        }
    }
}

pub fn pipeline_config(config: &AppConfig) -> PipelineConfig {
    PipelineConfig {
        tick_interval: Duration::from_millis(config.analytics_tick_ms),
        ..PipelineConfig::default()
    }
}

pub fn upload_config(config: &AppConfig) -> UploadConfig {
    UploadConfig {
        interval: Duration::from_secs(config.upload_interval_secs),
        telemetry_batch_size: config.upload_telemetry_batch,
        analytics_batch_size: config.upload_analytics_batch,
        max_batches_per_cycle: config.upload_max_batches_per_cycle,
        send_timeout: Duration::from_millis(config.upload_timeout_ms),
        measurement_prefix: config.measurement_prefix.clone(),
    }
}

/// 构造云端发送器；MQTT 时返回其事件循环任务。
pub fn build_sink(config: &AppConfig) -> (Arc<dyn CloudSink>, Option<JoinHandle<()>>) {
    match config.cloud_sink {
        CloudSinkKind::Mqtt => {
            let sink_config = MqttSinkConfig {
                host: config.mqtt_host.clone(),
                port: config.mqtt_port,
                username: config.mqtt_username.clone(),
                password: config.mqtt_password.clone(),
                client_id: config.mqtt_client_id.clone(),
                topic: config.mqtt_topic.clone(),
                ack_timeout: Duration::from_millis(config.upload_timeout_ms),
            };
            info!(
                target: "edge.upload",
                host = %sink_config.host,
                port = sink_config.port,
                topic = %sink_config.topic,
                "cloud_sink_mqtt"
            );
            let (sink, eventloop) = MqttCloudSink::connect(sink_config);
            (Arc::new(sink), Some(eventloop))
        }
        CloudSinkKind::Noop => {
            warn!(target: "edge.upload", "cloud_sink_noop_records_discarded");
            (Arc::new(NoopSink), None)
        }
    }
}

/// 为单个资产启动连接与处理任务。
pub fn spawn_asset(
    asset: AssetConfiguration,
    settings: ConnectionSettings,
    connector: Arc<dyn OpcUaConnector>,
    buffer: Arc<dyn LocalBuffer>,
    pipeline_config: PipelineConfig,
    channel_capacity: usize,
    shutdown: watch::Receiver<bool>,
) -> (AssetHandle, Vec<JoinHandle<()>>) {
    let engine = AnalyticsEngine::for_asset(&asset);
    info!(
        target: "edge.app",
        asset_id = %asset.asset_name,
        endpoint = %asset.endpoint,
        tags = asset.node_mapping.len(),
        analytics = ?engine.analytics_types(),
        "asset_configured"
    );
    let asset_name = asset.asset_name.clone();
    let manager = ConnectionManager::new(Arc::new(asset), settings, connector);
    let handle = AssetHandle {
        asset_name: asset_name.clone(),
        state: manager.subscribe_state(),
    };

    let (points_tx, points_rx) = mpsc::channel(channel_capacity.max(1));
    let pipeline = AssetPipeline::new(engine, buffer, pipeline_config);
    let worker = tokio::spawn(pipeline.run(points_rx, shutdown.clone()));
    let connection = tokio::spawn(async move {
        let phase = manager.run(points_tx, shutdown).await;
        if phase == ConnectionPhase::Failed {
            error!(
                target: "edge.app",
                asset_id = %asset_name,
                last_error = manager.state().last_error.as_deref().unwrap_or("-"),
                "asset_connection_failed"
            );
        }
    });
    (handle, vec![connection, worker])
}

/// 保留期清理 + 容量检查循环。
pub async fn run_cleanup(
    buffer: Arc<dyn LocalBuffer>,
    retention: Duration,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // 首次 tick 立即返回，跳过
    ticker.tick().await;
    loop {
        tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => break,
            _ = ticker.tick() => {
                if let Err(err) = cleanup_once(buffer.as_ref(), retention).await {
                    warn!(target: "edge.buffer", error = %err, "buffer_cleanup_failed");
                    if matches!(err, BufferError::Closed) {
                        break;
                    }
                }
            }
        }
    }
}

pub async fn cleanup_once(buffer: &dyn LocalBuffer, retention: Duration) -> Result<(), BufferError> {
    let cutoff_ms = now_epoch_ms().saturating_sub(retention.as_millis() as i64);
    let deleted = buffer.cleanup_processed_older_than(cutoff_ms).await?;
    if deleted > 0 {
        record_retention_deleted(deleted);
        info!(target: "edge.buffer", deleted, cutoff_ms, "retention_cleanup");
    }
    buffer.enforce_size_limit().await?;
    Ok(())
}

/// 在宽限期内等待任务结束，超时后中止剩余任务。
pub async fn join_with_grace(handles: Vec<JoinHandle<()>>, grace: Duration) {
    let deadline = tokio::time::Instant::now() + grace;
    let mut aborted = 0usize;
    for mut handle in handles {
        match tokio::time::timeout_at(deadline, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(target: "edge.app", error = %err, "task_join_failed"),
            Err(_) => {
                handle.abort();
                aborted += 1;
            }
        }
    }
    if aborted > 0 {
        warn!(target: "edge.app", aborted, "tasks_aborted_after_grace");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{Quality, TelemetryPoint, TelemetryValue};
    use edge_storage::RecordKind;

    fn point(ts_ms: i64) -> TelemetryPoint {
        TelemetryPoint {
            ts_ms,
            enterprise: "GlobalCorp".to_string(),
            site: "Dallas".to_string(),
            area: "Assembly".to_string(),
            line: "Line1".to_string(),
            machine: "Press_01".to_string(),
            tag: "power".to_string(),
            value: TelemetryValue::Float(1.0),
            unit: None,
            quality: Quality::Good,
        }
    }

    #[tokio::test]
    async fn cleanup_removes_only_old_processed_records() {
        let buffer = InMemoryBuffer::default();
        buffer.save_point(&point(1)).await.expect("save");
        buffer.save_point(&point(2)).await.expect("save");
        let batch = buffer
            .get_batch(RecordKind::Telemetry, 1)
            .await
            .expect("batch")
            .expect("records");
        buffer.mark_processed(&batch.batch_id).await.expect("mark");

        // 保留期为零：已确认记录即刻过期
        tokio::time::sleep(Duration::from_millis(5)).await;
        cleanup_once(&buffer, Duration::ZERO).await.expect("cleanup");
        let status = buffer.get_buffer_status().await.expect("status");
        assert_eq!(status.telemetry_processed, 0);
        assert_eq!(status.telemetry_pending, 1);
        assert!(status.last_cleanup_ms.is_some());
    }

    #[test]
    fn client_settings_follow_config() {
        let mut config = AppConfig::from_env().expect("config");
        config.opcua_pki_dir = "/var/lib/edge/pki".to_string();
        config.opcua_publishing_interval_ms = 500;
        config.channel_capacity = 64;
        let settings = client_settings(&config);
        assert_eq!(settings.pki_dir, std::path::PathBuf::from("/var/lib/edge/pki"));
        assert_eq!(settings.publishing_interval, Duration::from_millis(500));
        assert_eq!(settings.event_capacity, 64);
        assert_eq!(settings.application_uri, config.opcua_application_uri);
    }

    #[tokio::test(start_paused = true)]
    async fn noop_connector_never_connects() {
        let mut config = AppConfig::from_env().expect("config");
        config.connector = ConnectorKind::Noop;
        let connector = build_connector(&config);
        let result = connector
            .connect("opc.tcp://press:4840", edge_ingest::SecurityPolicy::None, Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(edge_ingest::ConnectError::Transient(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn grace_period_aborts_stuck_tasks() {
        let finished = tokio::spawn(async {});
        let stuck = tokio::spawn(std::future::pending::<()>());
        join_with_grace(vec![finished, stuck], Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn asset_tasks_stop_on_shutdown() {
        let asset = AssetConfiguration::new("Press_01", "opc.tcp://press:4840");
        let buffer: Arc<dyn LocalBuffer> = Arc::new(InMemoryBuffer::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, tasks) = spawn_asset(
            asset,
            ConnectionSettings::default(),
            Arc::new(NoopConnector),
            buffer,
            PipelineConfig::default(),
            16,
            shutdown_rx,
        );
        assert_eq!(handle.asset_name, "Press_01");

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_ne!(handle.snapshot().phase, ConnectionPhase::Connected);

        shutdown_tx.send(true).expect("shutdown");
        for task in tasks {
            tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .expect("stopped")
                .expect("joined");
        }
        assert_eq!(handle.snapshot().phase, ConnectionPhase::Disconnected);
    }
}
