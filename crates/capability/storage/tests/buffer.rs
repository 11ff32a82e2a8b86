use domain::{AnalyticsResult, AnalyticsType, Quality, TelemetryPoint, TelemetryValue};
use edge_storage::{
    BufferError, BufferOptions, BufferPayload, EvictionOrder, EvictionPolicy, InMemoryBuffer,
    KindPreference, LocalBuffer, RecordKind, SqliteBuffer, connect_sqlite,
};
use tempfile::TempDir;

fn sample_point(tag: &str, ts_ms: i64, value: TelemetryValue) -> TelemetryPoint {
    TelemetryPoint {
        ts_ms,
        enterprise: "GlobalCorp".to_string(),
        site: "Dallas".to_string(),
        area: "Assembly".to_string(),
        line: "Line1".to_string(),
        machine: "Press_01".to_string(),
        tag: tag.to_string(),
        value,
        unit: Some("kW".to_string()),
        quality: Quality::Good,
    }
}

fn sample_result(ts_ms: i64) -> AnalyticsResult {
    AnalyticsResult::new(ts_ms, "Press_01", AnalyticsType::Energy)
        .with_metric("energy_kwh", 1.5)
        .with_metric("power_factor", None::<f64>)
        .with_score(Some(88.0))
}

/// 约 10 KB 的字符串值，用于快速触发容量上限。
fn bulky_point(ts_ms: i64) -> TelemetryPoint {
    sample_point("blob", ts_ms, TelemetryValue::String("x".repeat(10 * 1024)))
}

async fn sqlite_buffer(dir: &TempDir, options: BufferOptions) -> SqliteBuffer {
    SqliteBuffer::open(dir.path().join("buffer.db"), options)
        .await
        .expect("open sqlite buffer")
}

fn small_options(order: EvictionOrder) -> BufferOptions {
    BufferOptions {
        max_size_mb: 1,
        eviction: EvictionPolicy {
            order,
            kind: KindPreference::Oldest,
        },
    }
}

async fn ack_cycle_removes_only_batch(buffer: &dyn LocalBuffer) {
    for i in 0..5 {
        buffer
            .save_point(&sample_point("power", 1_000 + i, TelemetryValue::Float(i as f64)))
            .await
            .expect("save point");
    }
    buffer.save_analytics(&sample_result(2_000)).await.expect("save analytics");

    let batch = buffer
        .get_batch(RecordKind::Telemetry, 3)
        .await
        .expect("get batch")
        .expect("pending batch");
    assert_eq!(batch.len(), 3);
    let timestamps: Vec<i64> = batch
        .records
        .iter()
        .map(|record| match &record.payload {
            BufferPayload::Telemetry(point) => point.ts_ms,
            BufferPayload::Analytics(_) => panic!("wrong kind"),
        })
        .collect();
    assert_eq!(timestamps, vec![1_000, 1_001, 1_002]);

    assert_eq!(buffer.mark_processed(&batch.batch_id).await.expect("mark"), 3);
    assert_eq!(buffer.mark_processed(&batch.batch_id).await.expect("mark again"), 3);
    assert_eq!(buffer.delete_batch(&batch.batch_id).await.expect("delete"), 3);
    assert!(buffer.get_batch_by_id(&batch.batch_id).await.expect("by id").is_empty());

    let status = buffer.get_buffer_status().await.expect("status");
    assert_eq!(status.telemetry_pending, 2);
    assert_eq!(status.telemetry_processed, 0);
    assert_eq!(status.analytics_pending, 1);

    let rest = buffer
        .get_batch(RecordKind::Telemetry, 10)
        .await
        .expect("rest")
        .expect("remaining");
    assert_eq!(rest.len(), 2);
    let analytics = buffer
        .get_batch(RecordKind::Analytics, 10)
        .await
        .expect("analytics")
        .expect("analytics batch");
    match &analytics.records[0].payload {
        BufferPayload::Analytics(result) => assert_eq!(result, &sample_result(2_000)),
        BufferPayload::Telemetry(_) => panic!("wrong kind"),
    }
}

async fn delete_requires_processed(buffer: &dyn LocalBuffer) {
    buffer
        .save_point(&sample_point("state", 1, TelemetryValue::Bool(true)))
        .await
        .expect("save");
    let batch = buffer
        .get_batch(RecordKind::Telemetry, 10)
        .await
        .expect("batch")
        .expect("pending");
    assert_eq!(buffer.delete_batch(&batch.batch_id).await.expect("delete"), 0);

    // 未确认前再次取批次会返回同样的记录
    let retry = buffer
        .get_batch(RecordKind::Telemetry, 10)
        .await
        .expect("retry")
        .expect("still pending");
    assert_eq!(retry.ids(), batch.ids());
    assert_ne!(retry.batch_id, batch.batch_id);
    assert_eq!(buffer.mark_processed(&batch.batch_id).await.expect("stale batch"), 0);
    assert!(buffer.get_batch(RecordKind::Analytics, 10).await.expect("none").is_none());
}

async fn retention_cleanup_keeps_pending(buffer: &dyn LocalBuffer) {
    buffer
        .save_batch(
            &[
                sample_point("power", 1, TelemetryValue::Float(1.0)),
                sample_point("power", 2, TelemetryValue::Float(2.0)),
            ],
            &[sample_result(2)],
        )
        .await
        .expect("save batch");
    let batch = buffer
        .get_batch(RecordKind::Telemetry, 1)
        .await
        .expect("batch")
        .expect("pending");
    buffer.mark_processed(&batch.batch_id).await.expect("mark");

    let cutoff = domain::now_epoch_ms() + 60_000;
    assert_eq!(buffer.cleanup_processed_older_than(cutoff).await.expect("cleanup"), 1);
    let status = buffer.get_buffer_status().await.expect("status");
    assert_eq!(status.telemetry_pending, 1);
    assert_eq!(status.analytics_pending, 1);
    assert!(status.last_cleanup_ms.is_some());
}

async fn overflow_with_only_pending_purges_oldest(buffer: &dyn LocalBuffer) {
    let before = edge_telemetry::metrics().snapshot().purged_unprocessed;
    let points: Vec<TelemetryPoint> = (0..150).map(bulky_point).collect();
    for chunk in points.chunks(10) {
        buffer.save_batch(chunk, &[]).await.expect("save");
    }
    let status = buffer.get_buffer_status().await.expect("status");
    assert!(status.telemetry_pending < 150);
    assert!(status.total_size_bytes <= 1024 * 1024);
    let purged = 150 - status.telemetry_pending;
    assert!(edge_telemetry::metrics().snapshot().purged_unprocessed >= before + purged);

    let batch = buffer
        .get_batch(RecordKind::Telemetry, 1)
        .await
        .expect("batch")
        .expect("pending");
    match &batch.records[0].payload {
        BufferPayload::Telemetry(point) => assert_eq!(point.ts_ms, purged as i64),
        BufferPayload::Analytics(_) => panic!("wrong kind"),
    }
}

async fn overflow_with_processed_backlog_spares_pending(buffer: &dyn LocalBuffer) {
    let first: Vec<TelemetryPoint> = (0..60).map(bulky_point).collect();
    buffer.save_batch(&first, &[]).await.expect("save first");
    let batch = buffer
        .get_batch(RecordKind::Telemetry, 100)
        .await
        .expect("batch")
        .expect("pending");
    buffer.mark_processed(&batch.batch_id).await.expect("mark");

    let second: Vec<TelemetryPoint> = (100..160).map(bulky_point).collect();
    buffer.save_batch(&second, &[]).await.expect("save second");

    let status = buffer.get_buffer_status().await.expect("status");
    assert_eq!(status.telemetry_pending, 60);
    assert!(status.telemetry_processed < 60);
    assert!(status.total_size_bytes <= 1024 * 1024);
    let report = buffer.enforce_size_limit().await.expect("enforce");
    assert!(report.is_empty());
}

async fn overflow_never_strands_analytics(buffer: &dyn LocalBuffer) {
    for ts in 0..120 {
        buffer
            .save_batch(&[bulky_point(ts)], &[sample_result(ts)])
            .await
            .expect("save");
    }
    let status = buffer.get_buffer_status().await.expect("status");
    assert!(status.telemetry_pending < 120);

    let oldest_point = buffer
        .get_batch(RecordKind::Telemetry, 1)
        .await
        .expect("telemetry batch")
        .expect("telemetry pending");
    let oldest_point_ts = match &oldest_point.records[0].payload {
        BufferPayload::Telemetry(point) => point.ts_ms,
        BufferPayload::Analytics(_) => panic!("wrong kind"),
    };
    let oldest_result = buffer
        .get_batch(RecordKind::Analytics, 1)
        .await
        .expect("analytics batch");
    if let Some(batch) = oldest_result {
        match &batch.records[0].payload {
            BufferPayload::Analytics(result) => assert!(result.ts_ms >= oldest_point_ts),
            BufferPayload::Telemetry(_) => panic!("wrong kind"),
        }
    }
}

#[tokio::test]
async fn in_memory_ack_cycle() {
    ack_cycle_removes_only_batch(&InMemoryBuffer::default()).await;
}

#[tokio::test]
async fn in_memory_delete_requires_processed() {
    delete_requires_processed(&InMemoryBuffer::default()).await;
}

#[tokio::test]
async fn in_memory_retention_cleanup() {
    retention_cleanup_keeps_pending(&InMemoryBuffer::default()).await;
}

#[tokio::test]
async fn in_memory_overflow_purges_pending() {
    overflow_with_only_pending_purges_oldest(&InMemoryBuffer::new(small_options(
        EvictionOrder::ProcessedFirst,
    )))
    .await;
}

#[tokio::test]
async fn in_memory_overflow_prefers_processed() {
    overflow_with_processed_backlog_spares_pending(&InMemoryBuffer::new(small_options(
        EvictionOrder::ProcessedFirst,
    )))
    .await;
}

#[tokio::test]
async fn in_memory_write_failure_is_surfaced() {
    let buffer = InMemoryBuffer::default();
    buffer.set_fail_writes(true);
    let err = buffer
        .save_point(&sample_point("power", 1, TelemetryValue::Float(1.0)))
        .await
        .expect_err("write fails");
    assert!(matches!(err, BufferError::Storage(_)));
    assert!(buffer.is_empty());
}

#[tokio::test]
async fn sqlite_ack_cycle() {
    let dir = TempDir::new().expect("tempdir");
    ack_cycle_removes_only_batch(&sqlite_buffer(&dir, BufferOptions::default()).await).await;
}

#[tokio::test]
async fn sqlite_delete_requires_processed() {
    let dir = TempDir::new().expect("tempdir");
    delete_requires_processed(&sqlite_buffer(&dir, BufferOptions::default()).await).await;
}

#[tokio::test]
async fn sqlite_retention_cleanup() {
    let dir = TempDir::new().expect("tempdir");
    retention_cleanup_keeps_pending(&sqlite_buffer(&dir, BufferOptions::default()).await).await;
}

#[tokio::test]
async fn sqlite_overflow_purges_pending() {
    let dir = TempDir::new().expect("tempdir");
    let buffer = sqlite_buffer(&dir, small_options(EvictionOrder::ProcessedFirst)).await;
    overflow_with_only_pending_purges_oldest(&buffer).await;
}

#[tokio::test]
async fn sqlite_overflow_prefers_processed() {
    let dir = TempDir::new().expect("tempdir");
    let buffer = sqlite_buffer(&dir, small_options(EvictionOrder::ProcessedFirst)).await;
    overflow_with_processed_backlog_spares_pending(&buffer).await;
}

#[tokio::test]
async fn sqlite_records_survive_reopen() {
    let dir = TempDir::new().expect("tempdir");
    let buffer = sqlite_buffer(&dir, BufferOptions::default()).await;
    buffer
        .save_batch(
            &[sample_point("power", 7, TelemetryValue::Float(3.25))],
            &[sample_result(7)],
        )
        .await
        .expect("save");
    let size_before = buffer.get_buffer_status().await.expect("status").total_size_bytes;
    buffer.close().await.expect("close");
    assert!(matches!(
        buffer.get_buffer_status().await,
        Err(BufferError::Closed)
    ));

    let reopened = sqlite_buffer(&dir, BufferOptions::default()).await;
    let status = reopened.get_buffer_status().await.expect("status");
    assert_eq!(status.telemetry_pending, 1);
    assert_eq!(status.analytics_pending, 1);
    assert_eq!(status.total_size_bytes, size_before);

    let batch = reopened
        .get_batch(RecordKind::Telemetry, 10)
        .await
        .expect("batch")
        .expect("pending");
    match &batch.records[0].payload {
        BufferPayload::Telemetry(point) => {
            assert_eq!(point, &sample_point("power", 7, TelemetryValue::Float(3.25)))
        }
        BufferPayload::Analytics(_) => panic!("wrong kind"),
    }
}

#[tokio::test]
async fn in_memory_overflow_never_strands_analytics() {
    overflow_never_strands_analytics(&InMemoryBuffer::new(small_options(
        EvictionOrder::ProcessedFirst,
    )))
    .await;
}

#[tokio::test]
async fn sqlite_overflow_never_strands_analytics() {
    let dir = TempDir::new().expect("tempdir");
    let buffer = sqlite_buffer(&dir, small_options(EvictionOrder::ProcessedFirst)).await;
    overflow_never_strands_analytics(&buffer).await;
}

#[tokio::test]
async fn sqlite_committed_save_survives_failed_eviction() {
    let dir = TempDir::new().expect("tempdir");
    let pool = connect_sqlite(&dir.path().join("buffer.db"))
        .await
        .expect("pool");
    let buffer = SqliteBuffer::with_pool(pool.clone(), small_options(EvictionOrder::ProcessedFirst))
        .await
        .expect("open");
    // 淘汰查询联合两张表，删掉 analytics 表使其必然失败
    sqlx::query("drop table analytics")
        .execute(&pool)
        .await
        .expect("drop analytics");

    let points: Vec<TelemetryPoint> = (0..120).map(bulky_point).collect();
    let ids = buffer.save_batch(&points, &[]).await.expect("save is committed");
    assert_eq!(ids.len(), 120);

    let stored: i64 = sqlx::query_scalar("select count(*) from telemetry")
        .fetch_one(&pool)
        .await
        .expect("count");
    assert_eq!(stored, 120);
}
