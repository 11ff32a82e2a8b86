//! 滚动窗口：按时间有序的数值序列，增量维护均值、标准差与线性趋势。
//!
//! - 超过 `max_age_ms` 或超出 `max_count` 的样本从队首淘汰。
//! - 样本数未达 `min_samples` 或时间跨度未达 `min_span_ms` 前，统计量返回 `None`。
//! - 标准差为 0（或在数值误差范围内）时 z-score 固定为 0。

use std::collections::VecDeque;

/// 相对标准差下限，低于此值视为 0。
const STD_EPSILON: f64 = 1e-9;
/// 淘汰累计次数达到该值时，从样本重新计算累加和，抑制浮点漂移。
const RESUM_EVERY: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub ts_ms: i64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowConfig {
    pub max_age_ms: i64,
    pub max_count: Option<usize>,
    pub min_samples: usize,
    pub min_span_ms: i64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            max_age_ms: 30 * 60 * 1000,
            max_count: Some(1800),
            min_samples: 30,
            min_span_ms: 15 * 60 * 1000,
        }
    }
}

impl WindowConfig {
    pub fn sanitized(mut self) -> Self {
        self.max_age_ms = self.max_age_ms.max(1);
        self.max_count = self.max_count.map(|count| count.max(2));
        self.min_samples = self.min_samples.max(2);
        self.min_span_ms = self.min_span_ms.clamp(0, self.max_age_ms);
        self
    }
}

#[derive(Debug, Clone)]
pub struct RollingWindow {
    config: WindowConfig,
    samples: VecDeque<Sample>,
    origin_ts: i64,
    origin_value: f64,
    sum_x: f64,
    sum_y: f64,
    sum_xx: f64,
    sum_yy: f64,
    sum_xy: f64,
    evictions: u32,
}

impl RollingWindow {
    pub fn new(config: WindowConfig) -> Self {
        Self {
            config: config.sanitized(),
            samples: VecDeque::new(),
            origin_ts: 0,
            origin_value: 0.0,
            sum_x: 0.0,
            sum_y: 0.0,
            sum_xx: 0.0,
            sum_yy: 0.0,
            sum_xy: 0.0,
            evictions: 0,
        }
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    /// 追加样本并淘汰过期样本。
    ///
    /// 非有限值或早于最新样本的时间戳被拒绝（返回 false）。
    pub fn push(&mut self, ts_ms: i64, value: f64) -> bool {
        if !value.is_finite() {
            return false;
        }
        if let Some(last) = self.samples.back() {
            if ts_ms < last.ts_ms {
                return false;
            }
        }
        if self.samples.is_empty() {
            self.origin_ts = ts_ms;
            self.origin_value = value;
        }
        let sample = Sample { ts_ms, value };
        self.accumulate(sample, 1.0);
        self.samples.push_back(sample);
        self.expire(ts_ms);
        true
    }

    /// 以 `now_ms` 为基准淘汰过期样本。
    pub fn expire(&mut self, now_ms: i64) {
        let cutoff = now_ms.saturating_sub(self.config.max_age_ms);
        while let Some(front) = self.samples.front().copied() {
            if front.ts_ms >= cutoff {
                break;
            }
            self.samples.pop_front();
            self.accumulate(front, -1.0);
            self.evictions += 1;
        }
        if let Some(max_count) = self.config.max_count {
            while self.samples.len() > max_count {
                if let Some(front) = self.samples.pop_front() {
                    self.accumulate(front, -1.0);
                    self.evictions += 1;
                }
            }
        }
        if self.samples.is_empty() {
            self.clear_sums();
        } else if self.evictions >= RESUM_EVERY {
            self.resum();
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn latest(&self) -> Option<Sample> {
        self.samples.back().copied()
    }

    pub fn samples(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }

    pub fn span_ms(&self) -> i64 {
        match (self.samples.front(), self.samples.back()) {
            (Some(first), Some(last)) => last.ts_ms - first.ts_ms,
            _ => 0,
        }
    }

    /// 基线是否就绪（样本数与时间跨度均满足）。
    pub fn is_ready(&self) -> bool {
        self.samples.len() >= self.config.min_samples && self.span_ms() >= self.config.min_span_ms
    }

    pub fn mean(&self) -> Option<f64> {
        if !self.is_ready() {
            return None;
        }
        let n = self.samples.len() as f64;
        Some(self.origin_value + self.sum_y / n)
    }

    /// 样本标准差（n-1）。
    pub fn stddev(&self) -> Option<f64> {
        let mean = self.mean()?;
        let n = self.samples.len() as f64;
        let variance = ((self.sum_yy - self.sum_y * self.sum_y / n) / (n - 1.0)).max(0.0);
        let std = variance.sqrt();
        if std <= STD_EPSILON * mean.abs().max(1.0) {
            Some(0.0)
        } else {
            Some(std)
        }
    }

    /// `(value - mean) / stddev`；标准差为 0 时返回 0。
    pub fn z_score(&self, value: f64) -> Option<f64> {
        let mean = self.mean()?;
        let std = self.stddev()?;
        if std == 0.0 {
            return Some(0.0);
        }
        Some((value - mean) / std)
    }

    /// 全窗口最小二乘斜率（单位：值/秒）。
    pub fn trend_slope(&self) -> Option<f64> {
        if !self.is_ready() {
            return None;
        }
        let n = self.samples.len() as f64;
        let denom = n * self.sum_xx - self.sum_x * self.sum_x;
        if denom.abs() <= f64::EPSILON {
            return Some(0.0);
        }
        Some((n * self.sum_xy - self.sum_x * self.sum_y) / denom)
    }

    /// 最近 `horizon_ms` 内样本的最小二乘斜率；少于 3 个样本时返回 `None`。
    pub fn trend_slope_over(&self, horizon_ms: i64) -> Option<f64> {
        let tail = self.tail(horizon_ms);
        if tail.len() < 3 {
            return None;
        }
        let base_ts = tail[0].ts_ms;
        let base_value = tail[0].value;
        let n = tail.len() as f64;
        let (mut sx, mut sy, mut sxx, mut sxy) = (0.0, 0.0, 0.0, 0.0);
        for sample in &tail {
            let x = (sample.ts_ms - base_ts) as f64 / 1000.0;
            let y = sample.value - base_value;
            sx += x;
            sy += y;
            sxx += x * x;
            sxy += x * y;
        }
        let denom = n * sxx - sx * sx;
        if denom.abs() <= f64::EPSILON {
            return Some(0.0);
        }
        Some((n * sxy - sx * sy) / denom)
    }

    /// 最新值相对 `span_ms` 内最早值的百分比变化。
    pub fn percent_change_over(&self, span_ms: i64) -> Option<f64> {
        let tail = self.tail(span_ms);
        let (first, last) = (tail.first()?, tail.last()?);
        if last.ts_ms <= first.ts_ms || first.value == 0.0 {
            return None;
        }
        Some((last.value - first.value) / first.value.abs() * 100.0)
    }

    pub fn min(&self) -> Option<f64> {
        self.samples.iter().map(|s| s.value).reduce(f64::min)
    }

    pub fn max(&self) -> Option<f64> {
        self.samples.iter().map(|s| s.value).reduce(f64::max)
    }

    /// 最早样本时间戳。
    pub fn earliest_ts(&self) -> Option<i64> {
        self.samples.front().map(|s| s.ts_ms)
    }

    /// `[from_ms, to_ms)` 内样本的均值与最大值；无样本时返回 `None`。
    pub fn stats_between(&self, from_ms: i64, to_ms: i64) -> Option<(f64, f64)> {
        let start = self.samples.partition_point(|s| s.ts_ms < from_ms);
        let end = self.samples.partition_point(|s| s.ts_ms < to_ms);
        if start >= end {
            return None;
        }
        let (mut sum, mut max) = (0.0, f64::NEG_INFINITY);
        for sample in self.samples.range(start..end) {
            sum += sample.value;
            max = max.max(sample.value);
        }
        Some((sum / (end - start) as f64, max))
    }

    fn tail(&self, horizon_ms: i64) -> Vec<Sample> {
        let Some(last) = self.samples.back() else {
            return Vec::new();
        };
        let cutoff = last.ts_ms.saturating_sub(horizon_ms);
        let start = self.samples.partition_point(|s| s.ts_ms < cutoff);
        self.samples.range(start..).copied().collect()
    }

    fn accumulate(&mut self, sample: Sample, sign: f64) {
        let x = (sample.ts_ms - self.origin_ts) as f64 / 1000.0;
        let y = sample.value - self.origin_value;
        self.sum_x += sign * x;
        self.sum_y += sign * y;
        self.sum_xx += sign * x * x;
        self.sum_yy += sign * y * y;
        self.sum_xy += sign * x * y;
    }

    fn clear_sums(&mut self) {
        self.sum_x = 0.0;
        self.sum_y = 0.0;
        self.sum_xx = 0.0;
        self.sum_yy = 0.0;
        self.sum_xy = 0.0;
        self.evictions = 0;
    }

    fn resum(&mut self) {
        self.clear_sums();
        if let Some(front) = self.samples.front().copied() {
            self.origin_ts = front.ts_ms;
            self.origin_value = front.value;
        }
        let samples: Vec<Sample> = self.samples.iter().copied().collect();
        for sample in samples {
            self.accumulate(sample, 1.0);
        }
    }
}
