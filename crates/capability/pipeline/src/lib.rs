//! 单资产数据流水线：接入 → 分析 → 缓冲。
//!
//! 每个采集点与由它触发的分析结果在同一次 `save_batch` 中写入，
//! 分析结果不会先于其原始数据落盘。

use domain::{AnalyticsResult, TelemetryPoint, TelemetryValue, now_epoch_ms};
use edge_analytics::AnalyticsEngine;
use edge_ingest::wait_for_shutdown;
use edge_storage::{BufferError, LocalBuffer};
use edge_telemetry::{
    record_analytics_emitted, record_point_skipped, record_points_buffered, record_points_dropped,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Pipeline 处理错误。
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("buffer closed")]
    Closed,
    #[error("buffer error: {0}")]
    Buffer(#[from] BufferError),
}

/// Pipeline 参数。
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// 分析定时器周期（OEE/能耗区间结算、预测摘要）。
    pub tick_interval: Duration,
    /// 缓冲写入失败后的立即重试次数。
    pub max_retries: usize,
    /// 去重缓存容量（按 machine/tag/timestamp），0 表示关闭。
    pub dedup_cache_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            max_retries: 2,
            dedup_cache_size: 4096,
        }
    }
}

impl PipelineConfig {
    fn sanitized(mut self) -> Self {
        if self.tick_interval.is_zero() {
            self.tick_interval = Duration::from_secs(1);
        }
        self
    }
}

/// 单个采集点的处理结果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    Buffered { analytics: usize },
    Skipped(&'static str),
    /// 缓冲写入失败，数据已丢弃（已记录）。
    Dropped(String),
}

/// 重订阅时服务端会重发最新值，按采集点标识去重。
struct DedupState {
    seen: HashMap<(String, i64), u64>,
    order: VecDeque<((String, i64), u64)>,
    counter: u64,
    capacity: usize,
}

impl DedupState {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashMap::new(),
            order: VecDeque::new(),
            counter: 0,
            capacity,
        }
    }

    fn contains(&self, point: &TelemetryPoint) -> bool {
        self.capacity > 0 && self.seen.contains_key(&(point.tag.clone(), point.ts_ms))
    }

    /// 仅在写入成功后登记，写入失败的点重发时仍可被接收。
    fn remember(&mut self, point: &TelemetryPoint) {
        if self.capacity == 0 {
            return;
        }
        let key = (point.tag.clone(), point.ts_ms);
        if self.seen.contains_key(&key) {
            return;
        }
        self.counter = self.counter.saturating_add(1);
        let token = self.counter;
        self.seen.insert(key.clone(), token);
        self.order.push_back((key, token));
        while self.seen.len() > self.capacity {
            let Some((evict_key, evict_token)) = self.order.pop_front() else {
                break;
            };
            if self.seen.get(&evict_key) == Some(&evict_token) {
                self.seen.remove(&evict_key);
            }
        }
    }
}

fn invalid_reason(point: &TelemetryPoint) -> Option<&'static str> {
    if point.ts_ms <= 0 {
        return Some("invalid_ts");
    }
    if let TelemetryValue::Float(value) = point.value {
        if !value.is_finite() {
            return Some("invalid_value");
        }
    }
    None
}

/// 单资产流水线，由该资产的 worker 独占。
pub struct AssetPipeline {
    engine: AnalyticsEngine,
    buffer: Arc<dyn LocalBuffer>,
    config: PipelineConfig,
    dedup: DedupState,
}

impl AssetPipeline {
    pub fn new(engine: AnalyticsEngine, buffer: Arc<dyn LocalBuffer>, config: PipelineConfig) -> Self {
        let config = config.sanitized();
        let dedup = DedupState::new(config.dedup_cache_size);
        Self {
            engine,
            buffer,
            config,
            dedup,
        }
    }

    pub fn asset_id(&self) -> &str {
        self.engine.asset_id()
    }

    /// 分析并持久化一个采集点。仅在缓冲已关闭时返回错误。
    pub async fn handle(&mut self, point: TelemetryPoint) -> Result<HandleOutcome, PipelineError> {
        if let Some(reason) = invalid_reason(&point) {
            record_point_skipped();
            debug!(target: "edge.pipeline", asset_id = %self.asset_id(), tag = %point.tag, reason, "point_skipped");
            return Ok(HandleOutcome::Skipped(reason));
        }
        if self.dedup.contains(&point) {
            record_point_skipped();
            return Ok(HandleOutcome::Skipped("duplicate"));
        }

        // 写入失败时回滚分析状态，分析只反映已落盘的采集点
        let snapshot = self.engine.clone();
        let results = self.engine.consume(&point);
        let analytics = results.len();
        let saved = self.save(std::slice::from_ref(&point), &results).await;
        if saved.is_err() {
            self.engine = snapshot;
        }
        match saved {
            Ok(()) => {
                self.dedup.remember(&point);
                record_points_buffered(1);
                record_analytics_emitted(analytics as u64);
                Ok(HandleOutcome::Buffered { analytics })
            }
            Err(PipelineError::Closed) => Err(PipelineError::Closed),
            Err(err) => {
                record_points_dropped(1);
                warn!(
                    target: "edge.pipeline",
                    asset_id = %self.asset_id(),
                    tag = %point.tag,
                    ts_ms = point.ts_ms,
                    count = 1 + analytics,
                    reason = "buffer_write_failed",
                    error = %err,
                    "points_dropped"
                );
                Ok(HandleOutcome::Dropped(err.to_string()))
            }
        }
    }

    /// 触发区间结算与周期摘要，返回写入的结果数。
    pub async fn tick(&mut self, now_ms: i64) -> Result<usize, PipelineError> {
        let results = self.engine.tick(now_ms);
        if results.is_empty() {
            return Ok(0);
        }
        match self.save(&[], &results).await {
            Ok(()) => {
                record_analytics_emitted(results.len() as u64);
                Ok(results.len())
            }
            Err(PipelineError::Closed) => Err(PipelineError::Closed),
            Err(err) => {
                warn!(
                    target: "edge.pipeline",
                    asset_id = %self.asset_id(),
                    count = results.len(),
                    reason = "buffer_write_failed",
                    error = %err,
                    "analytics_dropped"
                );
                Ok(0)
            }
        }
    }

    async fn save(
        &self,
        points: &[TelemetryPoint],
        results: &[AnalyticsResult],
    ) -> Result<(), PipelineError> {
        let mut attempt = 0;
        loop {
            match self.buffer.save_batch(points, results).await {
                Ok(_) => return Ok(()),
                Err(BufferError::Closed) => return Err(PipelineError::Closed),
                Err(err) => {
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        return Err(err.into());
                    }
                }
            }
        }
    }

    /// worker 主循环：按到达顺序处理采集点，周期性触发结算。
    ///
    /// 收到停机信号后先处理通道中已有的采集点再退出。
    pub async fn run(
        mut self,
        mut points: mpsc::Receiver<TelemetryPoint>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let asset_id = self.asset_id().to_string();
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(target: "edge.pipeline", asset_id = %asset_id, "pipeline_started");

        loop {
            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => break,
                point = points.recv() => {
                    let Some(point) = point else { break };
                    if let Err(err) = self.handle(point).await {
                        warn!(target: "edge.pipeline", asset_id = %asset_id, error = %err, "pipeline_stopped");
                        return;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.tick(now_epoch_ms()).await {
                        warn!(target: "edge.pipeline", asset_id = %asset_id, error = %err, "pipeline_stopped");
                        return;
                    }
                }
            }
        }

        let mut drained = 0usize;
        while let Ok(point) = points.try_recv() {
            if self.handle(point).await.is_err() {
                break;
            }
            drained += 1;
        }
        info!(target: "edge.pipeline", asset_id = %asset_id, drained, "pipeline_finished");
    }
}
