//! 预测性维护：每个监测标签一个滚动窗口，基于 z-score 与变化率识别异常，
//! 并综合异常频率、严重度与硬阈值距离给出 0-100 的健康分。
//!
//! 越过硬阈值单独作为 `threshold_alert` 上报，不并入异常判定。
//! 配置了 [`EnergyPattern`] 的标签另外比较最近时段与基线时段（功率尖峰、电压偏离、效率下降）。

use crate::window::{RollingWindow, WindowConfig};
use domain::{
    AnalyticsResult, AnalyticsType, EnergyPattern, MonitoredTag, PredictiveConfig, RateDirection,
    TelemetryPoint,
};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, info};

const ANOMALY_PENALTY: f64 = 5.0;
const ANOMALY_PENALTY_CAP: f64 = 30.0;
const SEVERITY_WEIGHT: f64 = 10.0;
const PROXIMITY_PENALTY: f64 = 25.0;
const PROXIMITY_BAND: f64 = 0.1;
const TREND_PENALTY: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    High,
    Low,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::High => "high",
            AlertLevel::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalyReason {
    ZScore,
    RateOfChange,
    PowerSpike,
    VoltageDeviation,
    EfficiencyDrop,
}

impl AnomalyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyReason::ZScore => "z_score",
            AnomalyReason::RateOfChange => "rate_of_change",
            AnomalyReason::PowerSpike => "power_spike",
            AnomalyReason::VoltageDeviation => "voltage_deviation",
            AnomalyReason::EfficiencyDrop => "efficiency_drop",
        }
    }
}

/// 能源模式命中：`magnitude` 为尖峰倍数、偏离百分比或下降百分点。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PatternHit {
    pub reason: AnomalyReason,
    pub magnitude: f64,
    pub high: bool,
}

impl PatternHit {
    pub fn severity(&self) -> &'static str {
        if self.high { "high" } else { "medium" }
    }
}

/// 单个标签的一次评估结果。
#[derive(Debug, Clone)]
pub struct TagEvaluation {
    pub tag: String,
    pub value: f64,
    pub z_score: Option<f64>,
    pub rate_change_percent: Option<f64>,
    pub anomaly: Option<AnomalyReason>,
    pub pattern: Option<PatternHit>,
    pub alert: Option<AlertLevel>,
    pub alert_changed: bool,
}

#[derive(Debug, Clone)]
struct TagMonitor {
    monitored: MonitoredTag,
    window: RollingWindow,
    last_value: Option<f64>,
    last_z: f64,
    alert: Option<AlertLevel>,
}

impl TagMonitor {
    fn evaluate(&mut self, ts_ms: i64, value: f64) -> TagEvaluation {
        // 先与既有基线比较，再入窗
        let z_score = self.window.z_score(value);
        self.window.push(ts_ms, value);
        self.last_value = Some(value);
        self.last_z = z_score.unwrap_or(0.0);

        let rate_change_percent = self
            .monitored
            .rate_limit
            .as_ref()
            .and_then(|limit| self.window.percent_change_over(limit.window_secs as i64 * 1000));
        let rate_breach = match (self.monitored.rate_limit.as_ref(), rate_change_percent) {
            (Some(limit), Some(change)) => match limit.direction {
                RateDirection::Drop => change <= -limit.percent,
                RateDirection::Rise => change >= limit.percent,
                RateDirection::Either => change.abs() >= limit.percent,
            },
            _ => false,
        };
        let pattern = self.match_pattern(ts_ms);
        let anomaly = if z_score.is_some_and(|z| z.abs() > self.monitored.z_threshold) {
            Some(AnomalyReason::ZScore)
        } else if rate_breach {
            Some(AnomalyReason::RateOfChange)
        } else {
            pattern.map(|hit| hit.reason)
        };

        let alert = match (self.monitored.high_limit, self.monitored.low_limit) {
            (Some(high), _) if value >= high => Some(AlertLevel::High),
            (_, Some(low)) if value <= low => Some(AlertLevel::Low),
            _ => None,
        };
        let alert_changed = alert != self.alert;
        self.alert = alert;

        TagEvaluation {
            tag: self.monitored.tag.clone(),
            value,
            z_score,
            rate_change_percent,
            anomaly,
            pattern,
            alert,
            alert_changed,
        }
    }

    /// 最近时段对比基线时段；窗口历史未覆盖基线起点时不判断。
    fn match_pattern(&self, now_ms: i64) -> Option<PatternHit> {
        let pattern = self.monitored.pattern.as_ref()?;
        let until = now_ms + 1;
        match *pattern {
            EnergyPattern::PowerSpike {
                ratio,
                high_ratio,
                recent_secs,
                baseline_secs,
            } => {
                let recent_from = now_ms - secs_to_ms(recent_secs);
                let (baseline, _) = self.baseline(recent_from, baseline_secs)?;
                let (_, peak) = self.window.stats_between(recent_from, until)?;
                if baseline <= 0.0 {
                    return None;
                }
                let spike = peak / baseline;
                (spike > ratio).then_some(PatternHit {
                    reason: AnomalyReason::PowerSpike,
                    magnitude: spike,
                    high: spike > high_ratio,
                })
            }
            EnergyPattern::VoltageDeviation {
                percent,
                high_percent,
                recent_secs,
                baseline_secs,
            } => {
                let recent_from = now_ms - secs_to_ms(recent_secs);
                let (baseline, _) = self.baseline(recent_from, baseline_secs)?;
                let (recent, _) = self.window.stats_between(recent_from, until)?;
                if baseline <= 0.0 {
                    return None;
                }
                let deviation = (recent - baseline).abs() / baseline * 100.0;
                (deviation > percent).then_some(PatternHit {
                    reason: AnomalyReason::VoltageDeviation,
                    magnitude: deviation,
                    high: deviation > high_percent,
                })
            }
            EnergyPattern::EfficiencyDrop {
                points,
                high_points,
                span_secs,
            } => {
                let recent_from = now_ms - secs_to_ms(span_secs);
                let (older, _) = self.baseline(recent_from, span_secs)?;
                let (recent, _) = self.window.stats_between(recent_from, until)?;
                let drop = older - recent;
                (drop > points).then_some(PatternHit {
                    reason: AnomalyReason::EfficiencyDrop,
                    magnitude: drop,
                    high: drop > high_points,
                })
            }
        }
    }

    fn baseline(&self, recent_from: i64, baseline_secs: u64) -> Option<(f64, f64)> {
        let baseline_from = recent_from - secs_to_ms(baseline_secs);
        if self.window.earliest_ts().is_none_or(|ts| ts > baseline_from) {
            return None;
        }
        self.window.stats_between(baseline_from, recent_from)
    }

    /// 单标签扣分：偏离严重度 + 距硬阈值远近 + 趋势逼近阈值。
    fn penalty(&self, horizon_secs: f64) -> f64 {
        let mut penalty = 0.0;
        let z = self.last_z.abs();
        if z > 1.0 && self.monitored.z_threshold > 0.0 {
            penalty += SEVERITY_WEIGHT * (z / self.monitored.z_threshold).min(2.0);
        }
        let Some(value) = self.last_value else {
            return penalty;
        };
        if self.alert.is_some() {
            penalty += PROXIMITY_PENALTY;
        } else if let Some(margin) = self.limit_margin(value) {
            if margin < PROXIMITY_BAND {
                penalty += PROXIMITY_PENALTY * (1.0 - margin / PROXIMITY_BAND);
            }
        }
        if let Some(slope) = self.window.trend_slope() {
            let approaching = match (self.monitored.high_limit, self.monitored.low_limit) {
                (Some(high), _) if slope > 0.0 && (high - value) / slope < horizon_secs => true,
                (_, Some(low)) if slope < 0.0 && (value - low) / -slope < horizon_secs => true,
                _ => false,
            };
            if approaching {
                penalty += TREND_PENALTY;
            }
        }
        penalty
    }

    /// 到最近硬阈值的相对距离（0 表示贴线）。
    fn limit_margin(&self, value: f64) -> Option<f64> {
        match (self.monitored.high_limit, self.monitored.low_limit) {
            (Some(high), Some(low)) if high > low => {
                Some(((high - value).min(value - low) / (high - low)).max(0.0))
            }
            (Some(high), None) => Some(((high - value) / high.abs().max(1.0)).max(0.0)),
            (None, Some(low)) => Some(((value - low) / low.abs().max(1.0)).max(0.0)),
            _ => None,
        }
    }
}

fn secs_to_ms(secs: u64) -> i64 {
    secs.min(i64::MAX as u64 / 1000) as i64 * 1000
}

#[derive(Debug, Clone)]
pub struct PredictiveAnalyzer {
    asset_id: String,
    config: PredictiveConfig,
    monitors: BTreeMap<String, TagMonitor>,
    anomalies: VecDeque<i64>,
    summary_ms: i64,
    next_summary_ms: Option<i64>,
}

impl PredictiveAnalyzer {
    pub fn new(asset_id: impl Into<String>, config: PredictiveConfig) -> Self {
        let window = WindowConfig {
            max_age_ms: config.window_secs as i64 * 1000,
            max_count: None,
            min_samples: config.min_samples,
            min_span_ms: config.min_baseline_secs as i64 * 1000,
        };
        let monitors = config
            .tags
            .iter()
            .map(|monitored| {
                let monitor = TagMonitor {
                    monitored: monitored.clone(),
                    window: RollingWindow::new(window.clone()),
                    last_value: None,
                    last_z: 0.0,
                    alert: None,
                };
                (monitored.tag.clone(), monitor)
            })
            .collect();
        let summary_ms = config.summary_interval_secs.max(1) as i64 * 1000;
        Self {
            asset_id: asset_id.into(),
            config,
            monitors,
            anomalies: VecDeque::new(),
            summary_ms,
            next_summary_ms: None,
        }
    }

    pub fn consume(&mut self, point: &TelemetryPoint) -> Option<AnalyticsResult> {
        let monitor = self.monitors.get_mut(&point.tag)?;
        let value = match point.value.as_f64() {
            Some(value) if point.is_good() => value,
            _ => {
                debug!(
                    target: "edge.analytics",
                    asset_id = %self.asset_id,
                    tag = %point.tag,
                    quality = point.quality.as_str(),
                    "predictive_input_skipped"
                );
                return None;
            }
        };
        let evaluation = monitor.evaluate(point.ts_ms, value);
        let trend = monitor.window.trend_slope();
        let mean = monitor.window.mean();
        let stddev = monitor.window.stddev();

        if evaluation.anomaly.is_some() {
            self.anomalies.push_back(point.ts_ms);
        }
        self.forget_anomalies(point.ts_ms);

        let alert_raised = evaluation.alert.is_some() && evaluation.alert_changed;
        if evaluation.anomaly.is_none() && !alert_raised {
            return None;
        }
        info!(
            target: "edge.analytics",
            asset_id = %self.asset_id,
            tag = %evaluation.tag,
            value = evaluation.value,
            z_score = evaluation.z_score.unwrap_or(0.0),
            anomaly = evaluation.anomaly.map(|r| r.as_str()).unwrap_or("none"),
            alert = evaluation.alert.map(|a| a.as_str()).unwrap_or("none"),
            "predictive_event"
        );

        let result = AnalyticsResult::new(point.ts_ms, self.asset_id.clone(), AnalyticsType::Predictive)
            .with_metric("tag", evaluation.tag.as_str())
            .with_metric("value", evaluation.value)
            .with_metric("z_score", evaluation.z_score)
            .with_metric("anomaly", evaluation.anomaly.is_some())
            .with_metric(
                "anomaly_reason",
                evaluation.anomaly.map(|r| r.as_str()).unwrap_or("none"),
            )
            .with_metric("rate_change_percent", evaluation.rate_change_percent)
            .with_metric(
                "pattern",
                evaluation.pattern.map(|hit| hit.reason.as_str()).unwrap_or("none"),
            )
            .with_metric("pattern_magnitude", evaluation.pattern.map(|hit| hit.magnitude))
            .with_metric(
                "pattern_severity",
                evaluation.pattern.map(|hit| hit.severity()).unwrap_or("none"),
            )
            .with_metric("threshold_alert", evaluation.alert.is_some())
            .with_metric(
                "alert_level",
                evaluation.alert.map(|a| a.as_str()).unwrap_or("none"),
            )
            .with_metric("trend_slope", trend)
            .with_metric("mean", mean)
            .with_metric("stddev", stddev)
            .with_metric("anomaly_count", self.anomalies.len() as f64)
            .with_score(Some(self.health_score()));
        Some(result)
    }

    /// 周期汇总；没有任何标签数据时不产出。
    pub fn tick(&mut self, now_ms: i64) -> Option<AnalyticsResult> {
        let due = *self.next_summary_ms.get_or_insert(now_ms + self.summary_ms);
        if now_ms < due {
            return None;
        }
        self.next_summary_ms = Some(now_ms + self.summary_ms);
        self.forget_anomalies(now_ms);
        for monitor in self.monitors.values_mut() {
            monitor.window.expire(now_ms);
        }
        if self.monitors.values().all(|m| m.last_value.is_none()) {
            return None;
        }

        let mut result =
            AnalyticsResult::new(now_ms, self.asset_id.clone(), AnalyticsType::Predictive)
                .with_metric("anomaly_count", self.anomalies.len() as f64)
                .with_metric(
                    "active_alerts",
                    self.monitors.values().filter(|m| m.alert.is_some()).count() as f64,
                );
        for (tag, monitor) in &self.monitors {
            result = result
                .with_metric(&format!("{tag}.value"), monitor.last_value)
                .with_metric(&format!("{tag}.mean"), monitor.window.mean())
                .with_metric(&format!("{tag}.stddev"), monitor.window.stddev())
                .with_metric(&format!("{tag}.trend_slope"), monitor.window.trend_slope())
                .with_metric(&format!("{tag}.z_score"), monitor.last_z);
        }
        Some(result.with_score(Some(self.health_score())))
    }

    /// 健康分：100 起扣，异常越多、越严重、越接近硬阈值分数越低。
    pub fn health_score(&self) -> f64 {
        let frequency = (self.anomalies.len() as f64 * ANOMALY_PENALTY).min(ANOMALY_PENALTY_CAP);
        let horizon_secs = self.config.window_secs as f64;
        let per_tag: f64 = self
            .monitors
            .values()
            .map(|monitor| monitor.penalty(horizon_secs))
            .sum();
        (100.0 - frequency - per_tag).clamp(0.0, 100.0)
    }

    pub fn anomaly_count(&self) -> usize {
        self.anomalies.len()
    }

    fn forget_anomalies(&mut self, now_ms: i64) {
        let cutoff = now_ms - self.config.anomaly_memory_secs as i64 * 1000;
        while self.anomalies.front().is_some_and(|ts| *ts < cutoff) {
            self.anomalies.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{AssetConfiguration, Quality, RateLimit};

    const BASE: i64 = 1_500_000_000_000;

    fn analyzer(tag: MonitoredTag) -> PredictiveAnalyzer {
        PredictiveAnalyzer::new(
            "Pump_01",
            PredictiveConfig {
                tags: vec![tag],
                window_secs: 1800,
                min_baseline_secs: 900,
                min_samples: 30,
                summary_interval_secs: 300,
                anomaly_memory_secs: 3600,
            },
        )
    }

    fn point(tag: &str, value: f64, offset_s: i64) -> TelemetryPoint {
        AssetConfiguration::new("Pump_01", "opc.tcp://sim:4840").point(
            "GlobalCorp",
            tag,
            value.into(),
            Quality::Good,
            BASE + offset_s * 1000,
        )
    }

    /// 10 ± 0.1 交替，1000 秒，步长 10 秒。
    fn stable(analyzer: &mut PredictiveAnalyzer, tag: &str) -> i64 {
        let mut offset = 0;
        for i in 0..100 {
            let value = if i % 2 == 0 { 9.9 } else { 10.1 };
            assert!(analyzer.consume(&point(tag, value, offset)).is_none());
            offset += 10;
        }
        offset
    }

    #[test]
    fn five_sigma_is_flagged_one_sigma_is_not() {
        let mut analyzer = analyzer(MonitoredTag::new("vibration"));
        let offset = stable(&mut analyzer, "vibration");

        assert!(analyzer.consume(&point("vibration", 10.05, offset)).is_none());

        let result = analyzer
            .consume(&point("vibration", 10.6, offset + 10))
            .expect("anomaly emitted");
        assert_eq!(result.flag("anomaly"), Some(true));
        assert!(result.number("z_score").expect("z") > 3.0);
        assert_eq!(result.flag("threshold_alert"), Some(false));
        assert!(result.score.expect("score") < 100.0);
    }

    #[test]
    fn no_anomaly_before_baseline_is_ready() {
        let mut analyzer = analyzer(MonitoredTag::new("vibration"));
        for i in 0..20 {
            assert!(analyzer.consume(&point("vibration", 10.0, i * 10)).is_none());
        }
        assert!(analyzer.consume(&point("vibration", 500.0, 200)).is_none());
        assert_eq!(analyzer.anomaly_count(), 0);
    }

    #[test]
    fn battery_drop_breaches_rate_limit() {
        let mut tag = MonitoredTag::new("battery_soc");
        tag.rate_limit = Some(RateLimit {
            percent: 20.0,
            window_secs: 300,
            direction: RateDirection::Drop,
        });
        let mut analyzer = analyzer(tag);
        analyzer.consume(&point("battery_soc", 80.0, 0));
        analyzer.consume(&point("battery_soc", 75.0, 100));
        let result = analyzer
            .consume(&point("battery_soc", 60.0, 200))
            .expect("rate anomaly");
        assert_eq!(
            result.metrics.get("anomaly_reason"),
            Some(&domain::MetricValue::Text("rate_of_change".to_string()))
        );
    }

    fn text(result: &AnalyticsResult, name: &str) -> Option<String> {
        match result.metrics.get(name) {
            Some(domain::MetricValue::Text(value)) => Some(value.clone()),
            _ => None,
        }
    }

    #[test]
    fn power_spike_against_baseline_mean() {
        let mut analyzer = analyzer(MonitoredTag::new("load_power").with_pattern(EnergyPattern::power_spike()));
        // 基线历史尚未覆盖 300 s 时不判断
        for offset in (0..300).step_by(10) {
            assert!(analyzer.consume(&point("load_power", 10.0, offset)).is_none());
        }
        let result = analyzer
            .consume(&point("load_power", 25.0, 300))
            .expect("spike emitted");
        assert_eq!(result.flag("anomaly"), Some(true));
        assert_eq!(text(&result, "anomaly_reason").as_deref(), Some("power_spike"));
        assert_eq!(text(&result, "pattern_severity").as_deref(), Some("medium"));
        assert!((result.number("pattern_magnitude").expect("ratio") - 2.5).abs() < 1e-9);
        assert_eq!(analyzer.anomaly_count(), 1);
    }

    #[test]
    fn large_voltage_deviation_is_high_severity() {
        let mut analyzer =
            analyzer(MonitoredTag::new("bus_voltage").with_pattern(EnergyPattern::voltage_deviation()));
        for offset in (0..480).step_by(10) {
            assert!(analyzer.consume(&point("bus_voltage", 400.0, offset)).is_none());
        }
        // 最近 120 s 只有这一个样本：偏离 20%
        let result = analyzer
            .consume(&point("bus_voltage", 320.0, 600))
            .expect("deviation emitted");
        assert_eq!(text(&result, "pattern").as_deref(), Some("voltage_deviation"));
        assert_eq!(text(&result, "pattern_severity").as_deref(), Some("high"));
        assert!((result.number("pattern_magnitude").expect("percent") - 20.0).abs() < 1e-9);
    }

    #[test]
    fn efficiency_drop_between_consecutive_spans() {
        let mut analyzer =
            analyzer(MonitoredTag::new("efficiency").with_pattern(EnergyPattern::efficiency_drop()));
        for offset in (0..300).step_by(10) {
            assert!(analyzer.consume(&point("efficiency", 90.0, offset)).is_none());
        }
        for offset in (300..600).step_by(10) {
            assert!(analyzer.consume(&point("efficiency", 70.0, offset)).is_none());
        }
        let result = analyzer
            .consume(&point("efficiency", 70.0, 600))
            .expect("drop emitted");
        assert_eq!(text(&result, "anomaly_reason").as_deref(), Some("efficiency_drop"));
        assert!((result.number("pattern_magnitude").expect("points") - 20.0).abs() < 1e-9);
    }

    #[test]
    fn steady_series_does_not_match_pattern() {
        let mut analyzer = analyzer(MonitoredTag::new("load_power").with_pattern(EnergyPattern::power_spike()));
        for offset in (0..900).step_by(10) {
            assert!(analyzer.consume(&point("load_power", 10.0, offset)).is_none());
        }
        assert_eq!(analyzer.anomaly_count(), 0);
    }

    #[test]
    fn hard_threshold_raises_distinct_alert_once() {
        let mut tag = MonitoredTag::new("temperature");
        tag.high_limit = Some(90.0);
        let mut analyzer = analyzer(tag);
        analyzer.consume(&point("temperature", 70.0, 0));
        let alert = analyzer
            .consume(&point("temperature", 95.0, 10))
            .expect("alert emitted");
        assert_eq!(alert.flag("threshold_alert"), Some(true));
        assert_eq!(alert.flag("anomaly"), Some(false));
        assert!(alert.score.expect("score") <= 75.0);

        assert!(analyzer.consume(&point("temperature", 96.0, 20)).is_none());
    }

    #[test]
    fn proximity_to_limit_lowers_score() {
        let mut tag = MonitoredTag::new("temperature");
        tag.high_limit = Some(100.0);
        tag.low_limit = Some(0.0);
        let mut analyzer = analyzer(tag);
        analyzer.consume(&point("temperature", 50.0, 0));
        let relaxed = analyzer.health_score();
        analyzer.consume(&point("temperature", 97.0, 10));
        assert!(analyzer.health_score() < relaxed);
        assert_eq!(relaxed, 100.0);
    }

    #[test]
    fn summary_is_emitted_on_interval() {
        let mut analyzer = analyzer(MonitoredTag::new("vibration"));
        assert!(analyzer.tick(BASE).is_none());
        analyzer.consume(&point("vibration", 1.0, 10));
        let summary = analyzer.tick(BASE + 300_000).expect("summary");
        assert_eq!(summary.number("vibration.value"), Some(1.0));
        assert_eq!(summary.score, Some(100.0));
    }
}
