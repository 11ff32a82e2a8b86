//! 边缘实时分析能力。
//!
//! 每个资产一个 [`AnalyticsEngine`]，按配置组合 OEE / 能耗 / 预测性维护三类分析。
//! 单个坏点或缺失输入只会让对应指标退化为 `InsufficientData`，不会中断流水线。

pub mod energy;
pub mod engine;
pub mod oee;
pub mod predictive;
pub mod window;

pub use energy::EnergyAnalyzer;
pub use engine::{AnalyticsEngine, Analyzer};
pub use oee::{OeeAnalyzer, overall_oee};
pub use predictive::{AlertLevel, AnomalyReason, PredictiveAnalyzer, TagEvaluation};
pub use window::{RollingWindow, Sample, WindowConfig};
