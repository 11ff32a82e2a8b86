//! OEE 分析：可用率 × 性能 × 质量。
//!
//! - 可用率按时间加权：两次状态观测之间的时长计入前一个状态。
//! - 计数标签为累计值，取相邻读数差；读数下降视为计数器复位。
//! - 结果在区间边界产出（事件时间或 tick 推进）。

use domain::{AnalyticsResult, AnalyticsType, OeeConfig, TelemetryPoint, TelemetryValue};
use tracing::debug;

/// `Availability × Performance × Quality`
pub fn overall_oee(availability: f64, performance: f64, quality: f64) -> f64 {
    availability * performance * quality
}

#[derive(Debug, Clone, Copy)]
struct StateMark {
    since_ms: i64,
    running: bool,
}

#[derive(Debug, Clone, Default)]
struct CounterTrack {
    last: Option<f64>,
    delta: f64,
}

impl CounterTrack {
    fn observe(&mut self, value: f64) {
        if let Some(last) = self.last {
            let diff = value - last;
            self.delta += if diff >= 0.0 { diff } else { value.max(0.0) };
        }
        self.last = Some(value);
    }

    /// 取出区间增量；从未观测过时返回 None。
    fn take(&mut self) -> Option<f64> {
        let out = self.last.map(|_| self.delta);
        self.delta = 0.0;
        out
    }
}

#[derive(Debug, Clone)]
pub struct OeeAnalyzer {
    asset_id: String,
    config: OeeConfig,
    interval_ms: i64,
    running_states: Vec<String>,
    interval_start_ms: Option<i64>,
    state: Option<StateMark>,
    running_ms: i64,
    planned_ms: i64,
    total: CounterTrack,
    good: CounterTrack,
    reject: CounterTrack,
}

impl OeeAnalyzer {
    pub fn new(asset_id: impl Into<String>, config: OeeConfig) -> Self {
        let interval_ms = (config.interval_secs.max(1) as i64) * 1000;
        let running_states = config
            .running_states
            .iter()
            .map(|state| state.trim().to_ascii_lowercase())
            .collect();
        Self {
            asset_id: asset_id.into(),
            config,
            interval_ms,
            running_states,
            interval_start_ms: None,
            state: None,
            running_ms: 0,
            planned_ms: 0,
            total: CounterTrack::default(),
            good: CounterTrack::default(),
            reject: CounterTrack::default(),
        }
    }

    pub fn consume(&mut self, point: &TelemetryPoint) -> Option<AnalyticsResult> {
        let tag = point.tag.as_str();
        let relevant = tag == self.config.state_tag
            || tag == self.config.total_count_tag
            || self.config.good_count_tag.as_deref() == Some(tag)
            || self.config.reject_count_tag.as_deref() == Some(tag);
        if !relevant {
            return None;
        }
        if !point.is_good() {
            debug!(
                target: "edge.analytics",
                asset_id = %self.asset_id,
                tag = %point.tag,
                quality = point.quality.as_str(),
                "oee_input_skipped"
            );
            return None;
        }

        let ts = point.ts_ms;
        if self.interval_start_ms.is_none() {
            self.interval_start_ms = Some(self.align(ts));
        }
        let closed = self.roll(ts);

        if tag == self.config.state_tag {
            let running = self.is_running(&point.value);
            if let Some(mark) = self.state {
                self.credit(ts - mark.since_ms, mark.running);
            }
            self.state = Some(StateMark {
                since_ms: ts,
                running,
            });
            return closed;
        }

        let Some(count) = point.value.as_f64() else {
            debug!(
                target: "edge.analytics",
                asset_id = %self.asset_id,
                tag = %point.tag,
                "oee_counter_not_numeric"
            );
            return closed;
        };
        if tag == self.config.total_count_tag {
            self.total.observe(count);
        }
        if self.config.good_count_tag.as_deref() == Some(tag) {
            self.good.observe(count);
        }
        if self.config.reject_count_tag.as_deref() == Some(tag) {
            self.reject.observe(count);
        }
        closed
    }

    pub fn tick(&mut self, now_ms: i64) -> Option<AnalyticsResult> {
        self.roll(now_ms)
    }

    fn roll(&mut self, ts: i64) -> Option<AnalyticsResult> {
        let start = self.interval_start_ms?;
        let end = start + self.interval_ms;
        if ts < end {
            return None;
        }
        let result = self.close(end);
        let next = self.align(ts);
        self.interval_start_ms = Some(next);
        if let Some(mark) = self.state.as_mut() {
            mark.since_ms = mark.since_ms.max(next);
        }
        Some(result)
    }

    fn close(&mut self, end_ms: i64) -> AnalyticsResult {
        if let Some(mut mark) = self.state {
            self.credit(end_ms - mark.since_ms, mark.running);
            mark.since_ms = end_ms;
            self.state = Some(mark);
        }

        let availability =
            (self.planned_ms > 0).then(|| self.running_ms as f64 / self.planned_ms as f64);
        let total = self.total.take();
        let reject = self.reject.take();
        let good = self.good.take().or(match (total, reject) {
            (Some(total), Some(reject)) => Some((total - reject).max(0.0)),
            _ => None,
        });
        let running_min = self.running_ms as f64 / 60_000.0;
        let actual_rate = total.filter(|_| running_min > 0.0).map(|t| t / running_min);
        let performance = actual_rate
            .filter(|_| self.config.ideal_rate_per_min > 0.0)
            .map(|rate| (rate / self.config.ideal_rate_per_min).min(1.0));
        let quality = match (good, total) {
            (Some(good), Some(total)) if total > 0.0 => Some((good / total).clamp(0.0, 1.0)),
            _ => None,
        };
        let oee = match (availability, performance, quality) {
            (Some(a), Some(p), Some(q)) => Some(overall_oee(a, p, q)),
            _ => None,
        };

        let result = AnalyticsResult::new(end_ms, self.asset_id.clone(), AnalyticsType::Oee)
            .with_metric("availability", availability)
            .with_metric("performance", performance)
            .with_metric("quality", quality)
            .with_metric("oee", oee)
            .with_metric("actual_rate_per_min", actual_rate)
            .with_metric("running_secs", self.running_ms as f64 / 1000.0)
            .with_metric("planned_secs", self.planned_ms as f64 / 1000.0)
            .with_metric("total_units", total)
            .with_metric("good_units", good)
            .with_score(oee.map(|value| value * 100.0));

        self.running_ms = 0;
        self.planned_ms = 0;
        result
    }

    fn credit(&mut self, duration_ms: i64, running: bool) {
        if duration_ms <= 0 {
            return;
        }
        self.planned_ms += duration_ms;
        if running {
            self.running_ms += duration_ms;
        }
    }

    fn is_running(&self, value: &TelemetryValue) -> bool {
        match value {
            TelemetryValue::Bool(flag) => *flag,
            other => {
                let text = other.as_text().to_ascii_lowercase();
                self.running_states.iter().any(|state| *state == text)
            }
        }
    }

    fn align(&self, ts: i64) -> i64 {
        ts - ts.rem_euclid(self.interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use domain::{AssetConfiguration, Quality};

    const BASE: i64 = 1_500_000_000_000;

    fn config() -> OeeConfig {
        OeeConfig {
            state_tag: "state".to_string(),
            running_states: vec!["running".to_string()],
            total_count_tag: "total".to_string(),
            good_count_tag: Some("good".to_string()),
            reject_count_tag: None,
            ideal_rate_per_min: 100.0,
            interval_secs: 300,
        }
    }

    fn point(tag: &str, value: TelemetryValue, offset_s: i64) -> TelemetryPoint {
        AssetConfiguration::new("Press_01", "opc.tcp://sim:4840").point(
            "GlobalCorp",
            tag,
            value,
            Quality::Good,
            BASE + offset_s * 1000,
        )
    }

    #[test]
    fn overall_is_product_of_factors() {
        assert_relative_eq!(overall_oee(0.9, 0.8, 0.95), 0.684, epsilon = 1e-12);
    }

    #[test]
    fn interval_yields_expected_factors() {
        let mut analyzer = OeeAnalyzer::new("Press_01", config());
        assert!(analyzer.consume(&point("state", "running".into(), 0)).is_none());
        analyzer.consume(&point("total", 0.0.into(), 0));
        analyzer.consume(&point("good", 0.0.into(), 0));
        analyzer.consume(&point("total", 360.0.into(), 270));
        analyzer.consume(&point("good", 342.0.into(), 270));
        analyzer.consume(&point("state", "stopped".into(), 270));

        let result = analyzer.tick(BASE + 300_000).expect("interval closes");
        assert_eq!(result.analytics_type, AnalyticsType::Oee);
        assert_relative_eq!(result.number("availability").expect("a"), 0.9, epsilon = 1e-9);
        assert_relative_eq!(result.number("performance").expect("p"), 0.8, epsilon = 1e-9);
        assert_relative_eq!(result.number("quality").expect("q"), 0.95, epsilon = 1e-9);
        assert_relative_eq!(result.number("oee").expect("oee"), 0.684, epsilon = 1e-9);
        assert_relative_eq!(result.score.expect("score"), 68.4, epsilon = 1e-6);
    }

    #[test]
    fn missing_counters_degrade_to_insufficient_data() {
        let mut analyzer = OeeAnalyzer::new("Press_01", config());
        analyzer.consume(&point("state", TelemetryValue::Bool(true), 0));
        let result = analyzer
            .consume(&point("state", TelemetryValue::Bool(true), 310))
            .expect("event time closes interval");

        assert_relative_eq!(result.number("availability").expect("a"), 1.0);
        assert!(result.metrics["performance"].is_insufficient());
        assert!(result.metrics["quality"].is_insufficient());
        assert!(result.metrics["oee"].is_insufficient());
        assert!(result.score.is_none());
    }

    #[test]
    fn counter_reset_counts_new_value() {
        let mut analyzer = OeeAnalyzer::new("Press_01", config());
        analyzer.consume(&point("state", "running".into(), 0));
        analyzer.consume(&point("total", 900.0.into(), 0));
        analyzer.consume(&point("total", 1000.0.into(), 60));
        analyzer.consume(&point("total", 50.0.into(), 120));

        let result = analyzer.tick(BASE + 300_000).expect("closed");
        assert_relative_eq!(result.number("total_units").expect("total"), 150.0);
    }

    #[test]
    fn bad_quality_and_malformed_inputs_are_skipped() {
        let mut analyzer = OeeAnalyzer::new("Press_01", config());
        let mut bad = point("state", "running".into(), 0);
        bad.quality = Quality::Bad;
        assert!(analyzer.consume(&bad).is_none());
        assert!(analyzer.consume(&point("total", "n/a".into(), 10)).is_none());
        assert!(analyzer.consume(&point("unrelated", 1.0.into(), 20)).is_none());
    }
}
