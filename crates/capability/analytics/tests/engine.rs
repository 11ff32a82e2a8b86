use domain::{
    AnalyticsType, AssetConfiguration, EnergyConfig, MonitoredTag, OeeConfig, PredictiveConfig,
    Quality, TelemetryPoint, TelemetryValue,
};
use edge_analytics::AnalyticsEngine;

const BASE: i64 = 1_500_000_000_000;

fn sample_asset() -> AssetConfiguration {
    let mut asset = AssetConfiguration::new("Line1_Press", "opc.tcp://sim:4840");
    asset.oee = Some(OeeConfig {
        state_tag: "state".to_string(),
        running_states: vec!["running".to_string()],
        total_count_tag: "total".to_string(),
        good_count_tag: Some("good".to_string()),
        reject_count_tag: None,
        ideal_rate_per_min: 60.0,
        interval_secs: 300,
    });
    asset.energy = Some(EnergyConfig {
        power_tag: "power".to_string(),
        voltage_tag: None,
        current_tag: None,
        power_factor_tag: None,
        three_phase: false,
        interval_secs: 300,
        kpi: None,
    });
    asset.predictive = Some(PredictiveConfig {
        tags: vec![MonitoredTag::new("power")],
        ..PredictiveConfig::default()
    });
    asset
}

fn sample_point(asset: &AssetConfiguration, tag: &str, value: TelemetryValue, offset_s: i64) -> TelemetryPoint {
    asset.point("GlobalCorp", tag, value, Quality::Good, BASE + offset_s * 1000)
}

#[test]
fn engine_builds_configured_analyzers() {
    let engine = AnalyticsEngine::for_asset(&sample_asset());
    assert_eq!(
        engine.analytics_types(),
        vec![AnalyticsType::Oee, AnalyticsType::Energy, AnalyticsType::Predictive]
    );
    let bare = AnalyticsEngine::for_asset(&AssetConfiguration::new("Idle", "opc.tcp://x"));
    assert!(bare.is_empty());
}

#[test]
fn tick_closes_oee_and_energy_intervals() {
    let asset = sample_asset();
    let mut engine = AnalyticsEngine::for_asset(&asset);
    for offset in [0, 60, 120, 180, 240] {
        engine.consume(&sample_point(&asset, "state", "running".into(), offset));
        engine.consume(&sample_point(&asset, "power", 4.0.into(), offset));
    }

    let results = engine.tick(BASE + 300_000);
    let types: Vec<AnalyticsType> = results.iter().map(|r| r.analytics_type).collect();
    assert!(types.contains(&AnalyticsType::Oee));
    assert!(types.contains(&AnalyticsType::Energy));
    assert!(results.iter().all(|r| r.asset_id == "Line1_Press"));
}

#[test]
fn points_for_other_assets_are_ignored() {
    let asset = sample_asset();
    let mut engine = AnalyticsEngine::for_asset(&asset);
    let other = AssetConfiguration::new("Other", "opc.tcp://x");
    let results = engine.consume(&sample_point(&other, "state", "running".into(), 0));
    assert!(results.is_empty());
    assert!(engine.tick(BASE + 600_000).is_empty());
}
