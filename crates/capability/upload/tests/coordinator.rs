use async_trait::async_trait;
use domain::{AnalyticsResult, AnalyticsType, Quality, TelemetryPoint, TelemetryValue};
use edge_storage::{InMemoryBuffer, LocalBuffer, RecordKind};
use edge_upload::{
    CloudSink, FieldValue, SinkError, UploadBatch, UploadConfig, UploadCoordinator,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// 可切换在线状态的云端，记录收到的批次。
#[derive(Default)]
struct FlakySink {
    offline: AtomicBool,
    received: Mutex<Vec<UploadBatch>>,
}

impl FlakySink {
    fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn telemetry_timestamps(&self) -> Vec<i64> {
        self.received
            .lock()
            .expect("received")
            .iter()
            .filter(|batch| batch.kind == RecordKind::Telemetry)
            .flat_map(|batch| batch.records.iter().map(|record| record.ts_ms))
            .collect()
    }
}

#[async_trait]
impl CloudSink for FlakySink {
    async fn send_batch(&self, batch: &UploadBatch) -> Result<(), SinkError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SinkError::Transport("cloud unreachable".to_string()));
        }
        self.received.lock().expect("received").push(batch.clone());
        Ok(())
    }
}

struct StalledSink;

#[async_trait]
impl CloudSink for StalledSink {
    async fn send_batch(&self, _batch: &UploadBatch) -> Result<(), SinkError> {
        std::future::pending().await
    }
}

fn sample_point(ts_ms: i64) -> TelemetryPoint {
    TelemetryPoint {
        ts_ms,
        enterprise: "GlobalCorp".to_string(),
        site: "Dallas".to_string(),
        area: "Assembly".to_string(),
        line: "Line1".to_string(),
        machine: "Press_01".to_string(),
        tag: "power".to_string(),
        value: TelemetryValue::Float(ts_ms as f64),
        unit: Some("kW".to_string()),
        quality: Quality::Good,
    }
}

fn config() -> UploadConfig {
    UploadConfig {
        telemetry_batch_size: 5,
        analytics_batch_size: 5,
        max_batches_per_cycle: 2,
        send_timeout: Duration::from_secs(1),
        ..UploadConfig::default()
    }
}

#[tokio::test]
async fn outage_keeps_everything_and_recovers_in_order() {
    let buffer = Arc::new(InMemoryBuffer::default());
    let sink = Arc::new(FlakySink::default());
    let coordinator = UploadCoordinator::new(buffer.clone(), sink.clone(), config());

    sink.set_offline(true);
    let mut occupancy = Vec::new();
    let mut next_ts = 1;
    for _ in 0..4 {
        for _ in 0..6 {
            buffer.save_point(&sample_point(next_ts)).await.expect("save");
            next_ts += 1;
        }
        let report = coordinator.run_cycle().await;
        assert!(!report.is_ok());
        assert_eq!(report.batches_sent, 0);
        occupancy.push(buffer.get_buffer_status().await.expect("status").telemetry_pending);
    }
    assert_eq!(occupancy, vec![6, 12, 18, 24]);
    assert!(!coordinator.health_check());

    sink.set_offline(false);
    let mut cycles = 0;
    while buffer.get_buffer_status().await.expect("status").total_records() > 0 {
        let report = coordinator.run_cycle().await;
        assert!(report.is_ok());
        cycles += 1;
        assert!(cycles < 10, "buffer did not drain");
    }
    assert_eq!(cycles, 3);
    assert!(coordinator.health_check());
    assert!(buffer.is_empty());

    let expected: Vec<i64> = (1..next_ts).collect();
    assert_eq!(sink.telemetry_timestamps(), expected);

    let stats = coordinator.stats();
    assert_eq!(stats.records_sent, 24);
    assert_eq!(stats.batches_sent, 5);
    assert_eq!(stats.failures, 4);
    assert!(stats.last_success_ms.is_some());
    let rate = stats.success_rate.expect("rate");
    assert!((rate - 5.0 / 9.0).abs() < 1e-9);
}

#[tokio::test]
async fn telemetry_and_analytics_are_both_drained() {
    let buffer = Arc::new(InMemoryBuffer::default());
    let sink = Arc::new(FlakySink::default());
    let coordinator = UploadCoordinator::new(buffer.clone(), sink.clone(), config());

    let result = AnalyticsResult::new(10, "Press_01", AnalyticsType::Energy)
        .with_metric("energy_kwh", 2.5)
        .with_score(Some(91.0));
    buffer
        .save_batch(&[sample_point(10)], std::slice::from_ref(&result))
        .await
        .expect("save");

    let report = coordinator.run_cycle().await;
    assert_eq!(report.batches_sent, 2);
    assert_eq!(report.records_sent, 2);

    let received = sink.received.lock().expect("received");
    assert_eq!(received[0].kind, RecordKind::Telemetry);
    assert_eq!(received[0].records[0].measurement, "opcua_telemetry");
    assert_eq!(received[1].kind, RecordKind::Analytics);
    let analytics = &received[1].records[0];
    assert_eq!(analytics.measurement, "opcua_analytics");
    assert_eq!(analytics.tags["analytics_type"], "energy");
    assert_eq!(analytics.fields["energy_kwh"], FieldValue::Float(2.5));
}

#[tokio::test(start_paused = true)]
async fn stalled_sink_times_out_and_keeps_batch() {
    let buffer = Arc::new(InMemoryBuffer::default());
    let coordinator = UploadCoordinator::new(buffer.clone(), Arc::new(StalledSink), config());
    buffer.save_point(&sample_point(1)).await.expect("save");

    let report = coordinator.run_cycle().await;
    assert_eq!(report.failed_batches, 1);
    let stats = coordinator.stats();
    assert!(stats.last_error.expect("error").contains("timed out"));
    let status = buffer.get_buffer_status().await.expect("status");
    assert_eq!(status.telemetry_pending, 1);
}

#[tokio::test]
async fn buffer_failure_is_reported_not_fatal() {
    let buffer = Arc::new(InMemoryBuffer::default());
    let sink = Arc::new(FlakySink::default());
    let coordinator = UploadCoordinator::new(buffer.clone(), sink.clone(), config());
    buffer.save_point(&sample_point(1)).await.expect("save");

    // 发送成功但确认失败：记录保持未处理，下个周期重发
    buffer.set_fail_writes(true);
    let report = coordinator.run_cycle().await;
    assert_eq!(report.failed_batches, 1);
    assert_eq!(buffer.len(), 1);

    buffer.set_fail_writes(false);
    let report = coordinator.run_cycle().await;
    assert!(report.is_ok());
    assert_eq!(sink.telemetry_timestamps(), vec![1, 1]);
    assert!(buffer.is_empty());
}
