use domain::{
    AnalyticsType, AssetConfiguration, MonitoredTag, OeeConfig, PredictiveConfig, Quality,
    TelemetryPoint, TelemetryValue,
};
use edge_analytics::AnalyticsEngine;
use edge_pipeline::{AssetPipeline, HandleOutcome, PipelineConfig, PipelineError};
use edge_storage::{BufferPayload, InMemoryBuffer, LocalBuffer, RecordKind};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

const BASE: i64 = 1_700_000_000_000;
/// 与 300 s 结算区间对齐的起点。
const SHIFT_START: i64 = 1_700_000_100_000;

fn monitored_asset() -> AssetConfiguration {
    let mut asset = AssetConfiguration::new("Press_01", "opc.tcp://press:4840");
    asset.predictive = Some(PredictiveConfig {
        tags: vec![MonitoredTag::new("temperature")],
        min_samples: 10,
        min_baseline_secs: 60,
        ..PredictiveConfig::default()
    });
    asset
}

fn reading(asset: &AssetConfiguration, value: f64, offset_s: i64) -> TelemetryPoint {
    asset.point(
        "GlobalCorp",
        "temperature",
        TelemetryValue::Float(value),
        Quality::Good,
        BASE + offset_s * 1000,
    )
}

fn pipeline_for(asset: &AssetConfiguration, buffer: Arc<InMemoryBuffer>) -> AssetPipeline {
    AssetPipeline::new(
        AnalyticsEngine::for_asset(asset),
        buffer,
        PipelineConfig::default(),
    )
}

#[tokio::test]
async fn anomaly_is_buffered_with_its_point() {
    let asset = monitored_asset();
    let buffer = Arc::new(InMemoryBuffer::default());
    let mut pipeline = pipeline_for(&asset, buffer.clone());

    for i in 0..120 {
        let value = 50.0 + if i % 2 == 0 { 0.5 } else { -0.5 };
        let outcome = pipeline.handle(reading(&asset, value, i)).await.expect("handle");
        assert_eq!(outcome, HandleOutcome::Buffered { analytics: 0 });
    }
    let outcome = pipeline.handle(reading(&asset, 80.0, 120)).await.expect("spike");
    assert_eq!(outcome, HandleOutcome::Buffered { analytics: 1 });

    let status = buffer.get_buffer_status().await.expect("status");
    assert_eq!(status.telemetry_pending, 121);
    assert_eq!(status.analytics_pending, 1);

    let batch = buffer
        .get_batch(RecordKind::Analytics, 10)
        .await
        .expect("batch")
        .expect("analytics");
    match &batch.records[0].payload {
        BufferPayload::Analytics(result) => {
            assert_eq!(result.analytics_type, AnalyticsType::Predictive);
            assert_eq!(result.ts_ms, BASE + 120_000);
        }
        BufferPayload::Telemetry(_) => panic!("wrong kind"),
    }
}

#[tokio::test]
async fn write_failure_drops_point_and_continues() {
    let asset = monitored_asset();
    let buffer = Arc::new(InMemoryBuffer::default());
    let mut pipeline = pipeline_for(&asset, buffer.clone());
    let before = edge_telemetry::metrics().snapshot().points_dropped;

    buffer.set_fail_writes(true);
    let outcome = pipeline.handle(reading(&asset, 50.0, 1)).await.expect("handle");
    assert!(matches!(outcome, HandleOutcome::Dropped(_)));
    assert!(edge_telemetry::metrics().snapshot().points_dropped > before);

    buffer.set_fail_writes(false);
    let outcome = pipeline.handle(reading(&asset, 50.0, 2)).await.expect("handle");
    assert_eq!(outcome, HandleOutcome::Buffered { analytics: 0 });
    assert_eq!(buffer.len(), 1);
}

fn press_with_oee() -> AssetConfiguration {
    let mut asset = AssetConfiguration::new("Press_01", "opc.tcp://press:4840");
    asset.oee = Some(OeeConfig {
        state_tag: "state".to_string(),
        running_states: vec!["running".to_string()],
        total_count_tag: "total".to_string(),
        good_count_tag: None,
        reject_count_tag: None,
        ideal_rate_per_min: 100.0,
        interval_secs: 300,
    });
    asset
}

fn machine_state(asset: &AssetConfiguration, state: &str, offset_s: i64) -> TelemetryPoint {
    asset.point(
        "GlobalCorp",
        "state",
        TelemetryValue::String(state.to_string()),
        Quality::Good,
        SHIFT_START + offset_s * 1000,
    )
}

async fn closed_availability(pipeline: &mut AssetPipeline, buffer: &InMemoryBuffer) -> f64 {
    assert_eq!(pipeline.tick(SHIFT_START + 300_000).await.expect("tick"), 1);
    let batch = buffer
        .get_batch(RecordKind::Analytics, 10)
        .await
        .expect("batch")
        .expect("analytics");
    match &batch.records[0].payload {
        BufferPayload::Analytics(result) => result.number("availability").expect("availability"),
        BufferPayload::Telemetry(_) => panic!("wrong kind"),
    }
}

#[tokio::test]
async fn dropped_point_does_not_feed_analytics() {
    let asset = press_with_oee();
    let buffer = Arc::new(InMemoryBuffer::default());
    let mut pipeline = pipeline_for(&asset, buffer.clone());
    pipeline
        .handle(machine_state(&asset, "running", 0))
        .await
        .expect("running");

    buffer.set_fail_writes(true);
    let outcome = pipeline
        .handle(machine_state(&asset, "stopped", 60))
        .await
        .expect("stopped");
    assert!(matches!(outcome, HandleOutcome::Dropped(_)));
    buffer.set_fail_writes(false);

    // 缓冲中只有 running，整个区间都应计为运行
    let availability = closed_availability(&mut pipeline, &buffer).await;
    assert!((availability - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn redelivered_point_is_accepted_after_failed_write() {
    let asset = press_with_oee();
    let buffer = Arc::new(InMemoryBuffer::default());
    let mut pipeline = pipeline_for(&asset, buffer.clone());
    pipeline
        .handle(machine_state(&asset, "running", 0))
        .await
        .expect("running");

    buffer.set_fail_writes(true);
    let dropped = pipeline
        .handle(machine_state(&asset, "stopped", 60))
        .await
        .expect("stopped");
    assert!(matches!(dropped, HandleOutcome::Dropped(_)));
    buffer.set_fail_writes(false);

    let redelivered = pipeline
        .handle(machine_state(&asset, "stopped", 60))
        .await
        .expect("redelivered");
    assert_eq!(redelivered, HandleOutcome::Buffered { analytics: 0 });
    assert_eq!(buffer.len(), 2);

    let availability = closed_availability(&mut pipeline, &buffer).await;
    assert!((availability - 0.2).abs() < 1e-9);
}

#[tokio::test]
async fn duplicates_and_invalid_points_are_skipped() {
    let asset = monitored_asset();
    let buffer = Arc::new(InMemoryBuffer::default());
    let mut pipeline = pipeline_for(&asset, buffer.clone());

    pipeline.handle(reading(&asset, 50.0, 1)).await.expect("first");
    let repeat = pipeline.handle(reading(&asset, 50.0, 1)).await.expect("repeat");
    assert_eq!(repeat, HandleOutcome::Skipped("duplicate"));
    let nan = pipeline.handle(reading(&asset, f64::NAN, 2)).await.expect("nan");
    assert_eq!(nan, HandleOutcome::Skipped("invalid_value"));
    assert_eq!(buffer.len(), 1);
}

#[tokio::test]
async fn closed_buffer_stops_pipeline() {
    let asset = monitored_asset();
    let buffer = Arc::new(InMemoryBuffer::default());
    let mut pipeline = pipeline_for(&asset, buffer.clone());
    buffer.close().await.expect("close");

    let err = pipeline
        .handle(reading(&asset, 50.0, 1))
        .await
        .expect_err("closed");
    assert!(matches!(err, PipelineError::Closed));
}

#[tokio::test]
async fn worker_persists_in_arrival_order_and_drains_on_shutdown() {
    let asset = monitored_asset();
    let buffer = Arc::new(InMemoryBuffer::default());
    let pipeline = pipeline_for(&asset, buffer.clone());
    let (points_tx, points_rx) = mpsc::channel(64);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    for i in 0..20 {
        points_tx
            .send(reading(&asset, 40.0 + i as f64, i))
            .await
            .expect("send");
    }
    shutdown_tx.send(true).expect("shutdown");
    pipeline.run(points_rx, shutdown_rx).await;

    let batch = buffer
        .get_batch(RecordKind::Telemetry, 100)
        .await
        .expect("batch")
        .expect("telemetry");
    let order: Vec<i64> = batch
        .records
        .iter()
        .map(|record| match &record.payload {
            BufferPayload::Telemetry(point) => point.ts_ms,
            BufferPayload::Analytics(_) => panic!("wrong kind"),
        })
        .collect();
    let expected: Vec<i64> = (0..20).map(|i| BASE + i * 1000).collect();
    assert_eq!(order, expected);
}
