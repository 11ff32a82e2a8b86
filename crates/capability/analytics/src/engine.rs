use crate::energy::EnergyAnalyzer;
use crate::oee::OeeAnalyzer;
use crate::predictive::PredictiveAnalyzer;
use domain::{AnalyticsResult, AnalyticsType, AssetConfiguration, TelemetryPoint};
use tracing::{debug, warn};

/// 分析模块（封闭集合，按资产配置选择）。
#[derive(Debug, Clone)]
pub enum Analyzer {
    Oee(OeeAnalyzer),
    Energy(EnergyAnalyzer),
    Predictive(PredictiveAnalyzer),
}

impl Analyzer {
    pub fn analytics_type(&self) -> AnalyticsType {
        match self {
            Analyzer::Oee(_) => AnalyticsType::Oee,
            Analyzer::Energy(_) => AnalyticsType::Energy,
            Analyzer::Predictive(_) => AnalyticsType::Predictive,
        }
    }

    pub fn consume(&mut self, point: &TelemetryPoint) -> Option<AnalyticsResult> {
        match self {
            Analyzer::Oee(analyzer) => analyzer.consume(point),
            Analyzer::Energy(analyzer) => analyzer.consume(point),
            Analyzer::Predictive(analyzer) => analyzer.consume(point),
        }
    }

    pub fn tick(&mut self, now_ms: i64) -> Option<AnalyticsResult> {
        match self {
            Analyzer::Oee(analyzer) => analyzer.tick(now_ms),
            Analyzer::Energy(analyzer) => analyzer.tick(now_ms),
            Analyzer::Predictive(analyzer) => analyzer.tick(now_ms),
        }
    }
}

/// 单资产分析引擎：持有该资产配置启用的全部分析模块。
#[derive(Debug, Clone)]
pub struct AnalyticsEngine {
    asset_id: String,
    analyzers: Vec<Analyzer>,
}

impl AnalyticsEngine {
    pub fn for_asset(asset: &AssetConfiguration) -> Self {
        let mut analyzers = Vec::new();
        if let Some(config) = asset.oee.clone() {
            analyzers.push(Analyzer::Oee(OeeAnalyzer::new(&asset.asset_name, config)));
        }
        if let Some(config) = asset.energy.clone() {
            analyzers.push(Analyzer::Energy(EnergyAnalyzer::new(&asset.asset_name, config)));
        }
        if let Some(config) = asset.predictive.clone() {
            analyzers.push(Analyzer::Predictive(PredictiveAnalyzer::new(
                &asset.asset_name,
                config,
            )));
        }
        Self {
            asset_id: asset.asset_name.clone(),
            analyzers,
        }
    }

    pub fn asset_id(&self) -> &str {
        &self.asset_id
    }

    pub fn analytics_types(&self) -> Vec<AnalyticsType> {
        self.analyzers.iter().map(Analyzer::analytics_type).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.analyzers.is_empty()
    }

    /// 按到达顺序喂入一个采集点，返回本次产生的结果（可能为空）。
    pub fn consume(&mut self, point: &TelemetryPoint) -> Vec<AnalyticsResult> {
        if point.machine != self.asset_id {
            warn!(
                target: "edge.analytics",
                asset_id = %self.asset_id,
                machine = %point.machine,
                tag = %point.tag,
                "point_for_other_asset"
            );
            return Vec::new();
        }
        let results: Vec<AnalyticsResult> = self
            .analyzers
            .iter_mut()
            .filter_map(|analyzer| analyzer.consume(point))
            .collect();
        self.log_emitted(&results);
        results
    }

    /// 推进时间，关闭到期区间。
    pub fn tick(&mut self, now_ms: i64) -> Vec<AnalyticsResult> {
        let results: Vec<AnalyticsResult> = self
            .analyzers
            .iter_mut()
            .filter_map(|analyzer| analyzer.tick(now_ms))
            .collect();
        self.log_emitted(&results);
        results
    }

    fn log_emitted(&self, results: &[AnalyticsResult]) {
        for result in results {
            debug!(
                target: "edge.analytics",
                asset_id = %self.asset_id,
                analytics_type = result.analytics_type.as_str(),
                score = result.score.unwrap_or(-1.0),
                "analytics_emitted"
            );
        }
    }
}
