//! 上传协调器
//!
//! 每个周期按 telemetry → analytics 顺序取批次、发送、确认、删除。
//! 发送失败的批次保持未处理状态，下个周期按原顺序整体重发；
//! 持久性由本地缓冲保证，周期间隔之外不再另做退避。

use crate::record::UploadBatch;
use crate::sink::CloudSink;
use domain::now_epoch_ms;
use edge_storage::{LocalBuffer, RecordKind};
use edge_telemetry::{record_upload_failure, record_upload_success};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// 上传参数。
#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub interval: Duration,
    pub telemetry_batch_size: usize,
    pub analytics_batch_size: usize,
    /// 每类记录每周期最多发送的批次数。
    pub max_batches_per_cycle: usize,
    pub send_timeout: Duration,
    pub measurement_prefix: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            telemetry_batch_size: 100,
            analytics_batch_size: 50,
            max_batches_per_cycle: 10,
            send_timeout: Duration::from_secs(10),
            measurement_prefix: "opcua".to_string(),
        }
    }
}

impl UploadConfig {
    pub fn sanitized(mut self) -> Self {
        if self.interval.is_zero() {
            self.interval = Duration::from_secs(1);
        }
        self.telemetry_batch_size = self.telemetry_batch_size.max(1);
        self.analytics_batch_size = self.analytics_batch_size.max(1);
        self.max_batches_per_cycle = self.max_batches_per_cycle.max(1);
        if self.send_timeout.is_zero() {
            self.send_timeout = Duration::from_secs(10);
        }
        self
    }

    fn batch_size(&self, kind: RecordKind) -> usize {
        match kind {
            RecordKind::Telemetry => self.telemetry_batch_size,
            RecordKind::Analytics => self.analytics_batch_size,
        }
    }
}

/// 上传统计。
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UploadStats {
    pub cycles: u64,
    pub batches_sent: u64,
    pub records_sent: u64,
    pub failures: u64,
    pub last_success_ms: Option<i64>,
    pub last_error: Option<String>,
    pub last_cycle_ok: Option<bool>,
    /// 批次成功率（0–1），尚无发送时为 None。
    pub success_rate: Option<f64>,
}

impl UploadStats {
    fn refresh_rate(&mut self) {
        let attempts = self.batches_sent + self.failures;
        self.success_rate = (attempts > 0).then(|| self.batches_sent as f64 / attempts as f64);
    }
}

/// 单个周期的结果。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub batches_sent: usize,
    pub records_sent: usize,
    pub failed_batches: usize,
}

impl CycleReport {
    pub fn is_ok(&self) -> bool {
        self.failed_batches == 0
    }
}

enum BatchOutcome {
    Sent(usize),
    Empty,
    Failed,
}

pub struct UploadCoordinator {
    buffer: Arc<dyn LocalBuffer>,
    sink: Arc<dyn CloudSink>,
    config: UploadConfig,
    stats: Mutex<UploadStats>,
}

impl UploadCoordinator {
    pub fn new(buffer: Arc<dyn LocalBuffer>, sink: Arc<dyn CloudSink>, config: UploadConfig) -> Self {
        Self {
            buffer,
            sink,
            config: config.sanitized(),
            stats: Mutex::new(UploadStats::default()),
        }
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    pub fn stats(&self) -> UploadStats {
        self.stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_default()
    }

    /// 最近一个周期是否全部成功；尚未运行时视为健康。
    pub fn health_check(&self) -> bool {
        self.stats().last_cycle_ok.unwrap_or(true)
    }

    fn with_stats(&self, apply: impl FnOnce(&mut UploadStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            apply(&mut stats);
            stats.refresh_rate();
        }
    }

    /// 执行一个上传周期。某类记录首个批次失败即停止该类，保证顺序。
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();
        for kind in RecordKind::all() {
            for _ in 0..self.config.max_batches_per_cycle {
                match self.upload_one(kind).await {
                    BatchOutcome::Sent(records) => {
                        report.batches_sent += 1;
                        report.records_sent += records;
                    }
                    BatchOutcome::Empty => break,
                    BatchOutcome::Failed => {
                        report.failed_batches += 1;
                        break;
                    }
                }
            }
        }
        self.with_stats(|stats| {
            stats.cycles += 1;
            stats.last_cycle_ok = Some(report.is_ok());
        });
        if report.batches_sent > 0 || !report.is_ok() {
            info!(
                target: "edge.upload",
                batches_sent = report.batches_sent,
                records_sent = report.records_sent,
                failed_batches = report.failed_batches,
                "upload_cycle_finished"
            );
        }
        report
    }

    async fn upload_one(&self, kind: RecordKind) -> BatchOutcome {
        let batch = match self.buffer.get_batch(kind, self.config.batch_size(kind)).await {
            Ok(Some(batch)) => batch,
            Ok(None) => return BatchOutcome::Empty,
            Err(err) => {
                self.fail(kind, None, err.to_string());
                return BatchOutcome::Failed;
            }
        };
        let upload = UploadBatch::from_buffer(&self.config.measurement_prefix, &batch);
        let started_at = Instant::now();
        let sent = match tokio::time::timeout(self.config.send_timeout, self.sink.send_batch(&upload)).await {
            Ok(result) => result.map_err(|err| err.to_string()),
            Err(_) => Err(format!(
                "send timed out after {} ms",
                self.config.send_timeout.as_millis()
            )),
        };
        if let Err(reason) = sent {
            self.fail(kind, Some(&batch.batch_id), reason);
            return BatchOutcome::Failed;
        }

        // 发送成功后才确认；确认失败时记录保持未处理，下次重发（至少一次）
        if let Err(err) = self.buffer.mark_processed(&batch.batch_id).await {
            self.fail(kind, Some(&batch.batch_id), format!("mark processed: {err}"));
            return BatchOutcome::Failed;
        }
        if let Err(err) = self.buffer.delete_batch(&batch.batch_id).await {
            // 已确认的记录会由保留期清理或容量淘汰回收
            warn!(
                target: "edge.upload",
                batch_id = %batch.batch_id,
                error = %err,
                "batch_delete_failed"
            );
        }

        let records = batch.len();
        let latency_ms = started_at.elapsed().as_millis() as u64;
        record_upload_success(records as u64, latency_ms);
        self.with_stats(|stats| {
            stats.batches_sent += 1;
            stats.records_sent += records as u64;
            stats.last_success_ms = Some(now_epoch_ms());
        });
        debug!(
            target: "edge.upload",
            kind = kind.as_str(),
            batch_id = %batch.batch_id,
            records,
            latency_ms,
            "batch_uploaded"
        );
        BatchOutcome::Sent(records)
    }

    fn fail(&self, kind: RecordKind, batch_id: Option<&str>, reason: String) {
        record_upload_failure();
        warn!(
            target: "edge.upload",
            kind = kind.as_str(),
            batch_id = batch_id.unwrap_or("-"),
            reason = %reason,
            "batch_upload_failed"
        );
        self.with_stats(|stats| {
            stats.failures += 1;
            stats.last_error = Some(reason);
        });
    }

    /// 按固定周期运行，直至停机信号。
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            target: "edge.upload",
            interval_secs = self.config.interval.as_secs(),
            "upload_loop_started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
            }
        }
        info!(target: "edge.upload", "upload_loop_stopped");
    }
}
