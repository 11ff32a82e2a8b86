//! 容量淘汰策略
//!
//! 超出容量上限时按策略逐阶段淘汰：
//! - `ProcessedFirst`（默认）：先删已上传记录，不足时再清除未上传记录
//! - `OldestFirst`：不区分上传状态，直接按创建时间淘汰
//!
//! 每个阶段内按 [`KindPreference`] 决定 telemetry 与 analytics 的先后。
//! 清除未上传记录属于有损路径，单独以 warn 级别记录。

use crate::models::RecordKind;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionOrder {
    #[default]
    ProcessedFirst,
    OldestFirst,
}

impl FromStr for EvictionOrder {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "processed_first" => Ok(EvictionOrder::ProcessedFirst),
            "oldest_first" => Ok(EvictionOrder::OldestFirst),
            other => Err(format!("unknown eviction order: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KindPreference {
    #[default]
    Oldest,
    TelemetryFirst,
    AnalyticsFirst,
}

impl KindPreference {
    /// 排序时的类别优先级（越小越先淘汰）。
    ///
    /// 除 `TelemetryFirst` 外，analytics 排在 telemetry 之前：同一批写入的原始点与
    /// 其派生结果创建时间相同，先淘汰结果才不会留下缺少原始数据的 analytics。
    pub fn rank(&self, kind: RecordKind) -> u8 {
        match (self, kind) {
            (KindPreference::TelemetryFirst, RecordKind::Telemetry) => 0,
            (KindPreference::TelemetryFirst, RecordKind::Analytics) => 1,
            (_, RecordKind::Analytics) => 0,
            (_, RecordKind::Telemetry) => 1,
        }
    }
}

impl FromStr for KindPreference {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "oldest" => Ok(KindPreference::Oldest),
            "telemetry_first" => Ok(KindPreference::TelemetryFirst),
            "analytics_first" => Ok(KindPreference::AnalyticsFirst),
            other => Err(format!("unknown eviction kind preference: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EvictionPolicy {
    pub order: EvictionOrder,
    pub kind: KindPreference,
}

/// 单个淘汰阶段：`processed` 为 None 表示不区分上传状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionPhase {
    pub processed: Option<bool>,
    pub kind: KindPreference,
}

impl EvictionPolicy {
    pub fn phases(&self) -> Vec<EvictionPhase> {
        match self.order {
            EvictionOrder::ProcessedFirst => vec![
                EvictionPhase {
                    processed: Some(true),
                    kind: self.kind,
                },
                EvictionPhase {
                    processed: Some(false),
                    kind: self.kind,
                },
            ],
            EvictionOrder::OldestFirst => vec![EvictionPhase {
                processed: None,
                kind: self.kind,
            }],
        }
    }
}

/// 淘汰候选（仅元数据，不含载荷）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub kind: RecordKind,
    pub id: i64,
    pub size_bytes: i64,
    pub processed: bool,
    pub created_at_ms: i64,
}

impl EvictionPhase {
    pub fn admits(&self, candidate: &EvictionCandidate) -> bool {
        self.processed.is_none_or(|processed| processed == candidate.processed)
    }

    /// 阶段内排序键：`Oldest` 按创建时间，其余先按类别。
    pub fn sort_key(&self, candidate: &EvictionCandidate) -> (i64, u8, i64, i64) {
        let rank = self.kind.rank(candidate.kind);
        match self.kind {
            KindPreference::Oldest => (candidate.created_at_ms, rank, candidate.id, 0),
            _ => (rank as i64, 0, candidate.created_at_ms, candidate.id),
        }
    }
}

/// 在候选集中按策略选出需淘汰的记录，直到释放不少于 `bytes_to_free`。
pub fn select_victims(
    candidates: &[EvictionCandidate],
    policy: &EvictionPolicy,
    bytes_to_free: i64,
) -> Vec<EvictionCandidate> {
    let mut victims = Vec::new();
    let mut freed = 0i64;
    for phase in policy.phases() {
        if freed >= bytes_to_free {
            break;
        }
        let mut eligible: Vec<&EvictionCandidate> =
            candidates.iter().filter(|c| phase.admits(c)).collect();
        eligible.sort_by_key(|c| phase.sort_key(c));
        for candidate in eligible {
            if freed >= bytes_to_free {
                break;
            }
            freed += candidate.size_bytes;
            victims.push(*candidate);
        }
    }
    victims
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictionReport {
    pub processed_removed: u64,
    pub unprocessed_removed: u64,
    pub bytes_freed: i64,
}

impl EvictionReport {
    pub fn is_empty(&self) -> bool {
        self.processed_removed == 0 && self.unprocessed_removed == 0
    }

    /// 是否发生了未上传数据的丢失。
    pub fn is_lossy(&self) -> bool {
        self.unprocessed_removed > 0
    }

    pub(crate) fn count(&mut self, candidate: &EvictionCandidate) {
        if candidate.processed {
            self.processed_removed += 1;
        } else {
            self.unprocessed_removed += 1;
        }
        self.bytes_freed += candidate.size_bytes;
    }
}

/// 记录淘汰日志与指标：正常清理与有损清除分开上报。
pub fn report_eviction(report: &EvictionReport, size_bytes: i64, max_bytes: i64) {
    if report.processed_removed > 0 {
        info!(
            target: "edge.buffer",
            count = report.processed_removed,
            reason = "size_limit",
            size_bytes,
            max_bytes,
            "processed_evicted"
        );
        edge_telemetry::record_evicted_processed(report.processed_removed);
    }
    if report.unprocessed_removed > 0 {
        warn!(
            target: "edge.buffer",
            count = report.unprocessed_removed,
            reason = "size_limit_exceeded_with_pending_data",
            size_bytes,
            max_bytes,
            "unprocessed_purged"
        );
        edge_telemetry::record_purged_unprocessed(report.unprocessed_removed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(kind: RecordKind, id: i64, processed: bool, created_at_ms: i64) -> EvictionCandidate {
        EvictionCandidate {
            kind,
            id,
            size_bytes: 100,
            processed,
            created_at_ms,
        }
    }

    fn sample() -> Vec<EvictionCandidate> {
        vec![
            candidate(RecordKind::Telemetry, 1, false, 10),
            candidate(RecordKind::Analytics, 1, true, 20),
            candidate(RecordKind::Telemetry, 2, true, 30),
            candidate(RecordKind::Analytics, 2, false, 5),
        ]
    }

    #[test]
    fn processed_first_prefers_acknowledged_records() {
        let victims = select_victims(&sample(), &EvictionPolicy::default(), 200);
        assert_eq!(victims.len(), 2);
        assert!(victims.iter().all(|v| v.processed));
        assert_eq!(victims[0].created_at_ms, 20);
    }

    #[test]
    fn processed_first_falls_through_to_unprocessed() {
        let victims = select_victims(&sample(), &EvictionPolicy::default(), 300);
        assert_eq!(victims.len(), 3);
        assert!(!victims[2].processed);
        assert_eq!(victims[2].kind, RecordKind::Analytics);
    }

    #[test]
    fn oldest_first_ignores_processed_flag() {
        let policy = EvictionPolicy {
            order: EvictionOrder::OldestFirst,
            kind: KindPreference::Oldest,
        };
        let victims = select_victims(&sample(), &policy, 100);
        assert_eq!(victims[0].created_at_ms, 5);
    }

    #[test]
    fn kind_preference_orders_within_phase() {
        let policy = EvictionPolicy {
            order: EvictionOrder::ProcessedFirst,
            kind: KindPreference::TelemetryFirst,
        };
        let victims = select_victims(&sample(), &policy, 400);
        assert_eq!(victims[2].kind, RecordKind::Telemetry);
        assert!(!victims[2].processed);
    }

    #[test]
    fn oldest_tie_evicts_analytics_before_its_raw_point() {
        let same_batch = vec![
            candidate(RecordKind::Telemetry, 7, false, 50),
            candidate(RecordKind::Analytics, 3, false, 50),
        ];
        let victims = select_victims(&same_batch, &EvictionPolicy::default(), 100);
        assert_eq!(victims.len(), 1);
        assert_eq!(victims[0].kind, RecordKind::Analytics);
    }

    #[test]
    fn policy_names_parse() {
        assert_eq!("oldest_first".parse::<EvictionOrder>(), Ok(EvictionOrder::OldestFirst));
        assert_eq!("analytics_first".parse::<KindPreference>(), Ok(KindPreference::AnalyticsFirst));
        assert!("random".parse::<EvictionOrder>().is_err());
    }
}
