//! 能耗分析：功率积分得到区间与累计电量，并计算功率因数。
//!
//! 配置 [`EnergyKpiConfig`] 时，区间结果另附可再生出力、负荷、电池 SoC 与系统效率 KPI。

use domain::{AnalyticsResult, AnalyticsType, EnergyConfig, EnergyKpiConfig, TelemetryPoint};
use tracing::debug;

const MS_PER_HOUR: f64 = 3_600_000.0;
/// 电池往返效率估算：基准值、波动扣分上限与所需最少样本数。
const BATTERY_BASE_EFFICIENCY: f64 = 95.0;
const BATTERY_EFFICIENCY_PENALTY_CAP: f64 = 10.0;
const BATTERY_MIN_SAMPLES: usize = 60;
/// 计算占比时的分母下限（kW / kWh）。
const SHARE_FLOOR: f64 = 0.1;

/// 区间内一组样本的累计量。
#[derive(Debug, Clone, Default)]
struct SeriesStats {
    sum: f64,
    sum_sq: f64,
    count: usize,
    min: Option<f64>,
    max: Option<f64>,
}

impl SeriesStats {
    fn observe(&mut self, value: f64) {
        self.sum += value;
        self.sum_sq += value * value;
        self.count += 1;
        self.min = Some(self.min.map_or(value, |min| min.min(value)));
        self.max = Some(self.max.map_or(value, |max| max.max(value)));
    }

    fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    fn stddev(&self) -> Option<f64> {
        if self.count < 2 {
            return None;
        }
        let n = self.count as f64;
        let variance = ((self.sum_sq - self.sum * self.sum / n) / (n - 1.0)).max(0.0);
        Some(variance.sqrt())
    }
}

#[derive(Debug, Clone)]
struct KpiTracker {
    config: EnergyKpiConfig,
    renewable: SeriesStats,
    load: SeriesStats,
    battery: SeriesStats,
    efficiency: SeriesStats,
    total_renewable_kwh: f64,
    total_load_kwh: f64,
}

impl KpiTracker {
    fn new(config: EnergyKpiConfig) -> Self {
        Self {
            config,
            renewable: SeriesStats::default(),
            load: SeriesStats::default(),
            battery: SeriesStats::default(),
            efficiency: SeriesStats::default(),
            total_renewable_kwh: 0.0,
            total_load_kwh: 0.0,
        }
    }

    fn watches(&self, tag: &str) -> bool {
        self.config.watches(tag)
    }

    fn observe(&mut self, tag: &str, value: f64) {
        let has = |tags: &[String]| tags.iter().any(|t| t == tag);
        if has(&self.config.renewable_tags) {
            self.renewable.observe(value);
        }
        if has(&self.config.load_tags) {
            self.load.observe(value);
        }
        if has(&self.config.battery_soc_tags) {
            self.battery.observe(value);
        }
        if has(&self.config.efficiency_tags) {
            self.efficiency.observe(value);
        }
    }

    /// 区间电量按平均功率 × 区间时长估算。
    fn close(&mut self, result: AnalyticsResult, interval_hours: f64) -> AnalyticsResult {
        let avg_renewable = self.renewable.mean();
        let renewable_kwh = avg_renewable.map(|avg| avg * interval_hours);
        if let Some(kwh) = renewable_kwh {
            self.total_renewable_kwh += kwh;
        }
        let avg_load = self.load.mean();
        let load_kwh = avg_load.map(|avg| avg * interval_hours);
        if let Some(kwh) = load_kwh {
            self.total_load_kwh += kwh;
        }
        let load_factor = match (avg_load, self.load.max) {
            (Some(avg), Some(peak)) if peak > 0.0 => Some(avg / peak * 100.0),
            (Some(_), Some(_)) => Some(0.0),
            _ => None,
        };

        let battery_utilization = match (self.battery.min, self.battery.max) {
            (Some(min), Some(max)) => Some(max - min),
            _ => None,
        };
        let battery_efficiency = (self.battery.count > 0).then(|| {
            if self.battery.count > BATTERY_MIN_SAMPLES {
                let spread = self.battery.stddev().unwrap_or(0.0);
                BATTERY_BASE_EFFICIENCY - (spread * 2.0).min(BATTERY_EFFICIENCY_PENALTY_CAP)
            } else {
                BATTERY_BASE_EFFICIENCY
            }
        });

        let renewable_share = match (avg_renewable, avg_load) {
            (Some(renewable), Some(load)) => {
                Some((renewable / load.max(SHARE_FLOOR) * 100.0).min(100.0))
            }
            _ => None,
        };
        let has_renewable = avg_renewable.is_some() || self.total_renewable_kwh > 0.0;
        let has_load = avg_load.is_some() || self.total_load_kwh > 0.0;
        let independence = (has_renewable && has_load).then(|| {
            (self.total_renewable_kwh / self.total_load_kwh.max(SHARE_FLOOR) * 100.0).min(100.0)
        });

        let result = result
            .with_metric("avg_renewable_power_kw", avg_renewable)
            .with_metric("peak_renewable_power_kw", self.renewable.max)
            .with_metric("renewable_energy_kwh", renewable_kwh)
            .with_metric("total_renewable_energy_kwh", has_renewable.then_some(self.total_renewable_kwh))
            .with_metric("avg_load_power_kw", avg_load)
            .with_metric("peak_load_power_kw", self.load.max)
            .with_metric("load_energy_kwh", load_kwh)
            .with_metric("total_load_energy_kwh", has_load.then_some(self.total_load_kwh))
            .with_metric("load_factor_percent", load_factor)
            .with_metric("avg_battery_soc_percent", self.battery.mean())
            .with_metric("min_battery_soc_percent", self.battery.min)
            .with_metric("max_battery_soc_percent", self.battery.max)
            .with_metric("battery_utilization_percent", battery_utilization)
            .with_metric("battery_round_trip_efficiency_percent", battery_efficiency)
            .with_metric("avg_system_efficiency_percent", self.efficiency.mean())
            .with_metric("renewable_share_percent", renewable_share)
            .with_metric("energy_independence_percent", independence);

        self.renewable = SeriesStats::default();
        self.load = SeriesStats::default();
        self.battery = SeriesStats::default();
        self.efficiency = SeriesStats::default();
        result
    }
}

#[derive(Debug, Clone)]
pub struct EnergyAnalyzer {
    asset_id: String,
    config: EnergyConfig,
    interval_ms: i64,
    interval_start_ms: Option<i64>,
    last_power: Option<(i64, f64)>,
    energy_kwh: f64,
    cumulative_kwh: f64,
    covered_ms: i64,
    power_sum: f64,
    power_samples: usize,
    peak_kw: Option<f64>,
    min_kw: Option<f64>,
    voltage: Option<f64>,
    current: Option<f64>,
    reported_pf: Option<f64>,
    apparent_kva: Option<f64>,
    pf_sum: f64,
    pf_samples: usize,
    kpi: Option<KpiTracker>,
}

impl EnergyAnalyzer {
    pub fn new(asset_id: impl Into<String>, config: EnergyConfig) -> Self {
        let interval_ms = (config.interval_secs.max(1) as i64) * 1000;
        let kpi = config.kpi.clone().map(KpiTracker::new);
        Self {
            asset_id: asset_id.into(),
            config,
            interval_ms,
            interval_start_ms: None,
            last_power: None,
            energy_kwh: 0.0,
            cumulative_kwh: 0.0,
            covered_ms: 0,
            power_sum: 0.0,
            power_samples: 0,
            peak_kw: None,
            min_kw: None,
            voltage: None,
            current: None,
            reported_pf: None,
            apparent_kva: None,
            pf_sum: 0.0,
            pf_samples: 0,
            kpi,
        }
    }

    pub fn cumulative_kwh(&self) -> f64 {
        self.cumulative_kwh
    }

    pub fn consume(&mut self, point: &TelemetryPoint) -> Option<AnalyticsResult> {
        let tag = point.tag.as_str();
        let is_power = tag == self.config.power_tag;
        let is_voltage = self.config.voltage_tag.as_deref() == Some(tag);
        let is_current = self.config.current_tag.as_deref() == Some(tag);
        let is_pf = self.config.power_factor_tag.as_deref() == Some(tag);
        let is_kpi = self.kpi.as_ref().is_some_and(|kpi| kpi.watches(tag));
        if !(is_power || is_voltage || is_current || is_pf || is_kpi) {
            return None;
        }
        let value = match point.value.as_f64() {
            Some(value) if point.is_good() => value,
            _ => {
                debug!(
                    target: "edge.analytics",
                    asset_id = %self.asset_id,
                    tag = %point.tag,
                    quality = point.quality.as_str(),
                    "energy_input_skipped"
                );
                return None;
            }
        };

        let ts = point.ts_ms;
        if self.interval_start_ms.is_none() {
            self.interval_start_ms = Some(ts - ts.rem_euclid(self.interval_ms));
        }
        let closed = self.roll(ts);

        if let Some(kpi) = self.kpi.as_mut().filter(|_| is_kpi) {
            kpi.observe(tag, value);
        }
        if is_voltage {
            self.voltage = Some(value);
        } else if is_current {
            self.current = Some(value);
        } else if is_pf {
            self.reported_pf = Some(value.clamp(0.0, 1.0));
        } else if is_power {
            self.observe_power(ts, value);
        }
        closed
    }

    pub fn tick(&mut self, now_ms: i64) -> Option<AnalyticsResult> {
        self.roll(now_ms)
    }

    fn observe_power(&mut self, ts: i64, power_kw: f64) {
        if let Some((prev_ts, prev_kw)) = self.last_power {
            self.integrate(prev_ts, prev_kw, ts, power_kw);
        }
        self.last_power = Some((ts, power_kw));
        self.power_sum += power_kw;
        self.power_samples += 1;
        self.peak_kw = Some(self.peak_kw.map_or(power_kw, |peak| peak.max(power_kw)));
        self.min_kw = Some(self.min_kw.map_or(power_kw, |min| min.min(power_kw)));

        if let (Some(voltage), Some(current)) = (self.voltage, self.current) {
            let phases = if self.config.three_phase { 3f64.sqrt() } else { 1.0 };
            let apparent = phases * voltage * current / 1000.0;
            if apparent > 0.0 {
                self.apparent_kva = Some(apparent);
                self.pf_sum += (power_kw.abs() / apparent).clamp(0.0, 1.0);
                self.pf_samples += 1;
            }
        }
    }

    fn integrate(&mut self, from_ts: i64, from_kw: f64, to_ts: i64, to_kw: f64) {
        let dt = to_ts - from_ts;
        if dt <= 0 {
            return;
        }
        self.energy_kwh += (from_kw + to_kw) / 2.0 * dt as f64 / MS_PER_HOUR;
        self.covered_ms += dt;
    }

    fn roll(&mut self, ts: i64) -> Option<AnalyticsResult> {
        let start = self.interval_start_ms?;
        let end = start + self.interval_ms;
        if ts < end {
            return None;
        }
        // 最后一个功率样本保持到区间边界
        if let Some((prev_ts, prev_kw)) = self.last_power {
            if prev_ts < end {
                self.integrate(prev_ts, prev_kw, end, prev_kw);
                self.last_power = Some((end, prev_kw));
            }
        }
        let result = self.close(end);
        self.interval_start_ms = Some(ts - ts.rem_euclid(self.interval_ms));
        Some(result)
    }

    fn close(&mut self, end_ms: i64) -> AnalyticsResult {
        let has_power = self.power_samples > 0 || self.covered_ms > 0;
        let energy = has_power.then_some(self.energy_kwh);
        self.cumulative_kwh += self.energy_kwh;

        let avg_kw = if self.covered_ms > 0 {
            Some(self.energy_kwh / (self.covered_ms as f64 / MS_PER_HOUR))
        } else if self.power_samples > 0 {
            Some(self.power_sum / self.power_samples as f64)
        } else {
            None
        };
        let load_factor = match (avg_kw, self.peak_kw) {
            (Some(avg), Some(peak)) if peak > 0.0 => Some(avg / peak),
            _ => None,
        };
        let power_factor = if self.pf_samples > 0 {
            Some(self.pf_sum / self.pf_samples as f64)
        } else {
            self.reported_pf
        };

        let result = AnalyticsResult::new(end_ms, self.asset_id.clone(), AnalyticsType::Energy)
            .with_metric("energy_kwh", energy)
            .with_metric("cumulative_kwh", self.cumulative_kwh)
            .with_metric("avg_power_kw", avg_kw)
            .with_metric("peak_power_kw", self.peak_kw)
            .with_metric("min_power_kw", self.min_kw)
            .with_metric("load_factor", load_factor)
            .with_metric("power_factor", power_factor)
            .with_metric("apparent_power_kva", self.apparent_kva)
            .with_score(power_factor.map(|pf| pf * 100.0));
        let interval_hours = self.interval_ms as f64 / MS_PER_HOUR;
        let result = match self.kpi.as_mut() {
            Some(kpi) => kpi.close(result, interval_hours),
            None => result,
        };

        self.energy_kwh = 0.0;
        self.covered_ms = 0;
        self.power_sum = 0.0;
        self.power_samples = 0;
        self.peak_kw = None;
        self.min_kw = None;
        self.pf_sum = 0.0;
        self.pf_samples = 0;
        result
    }
}
