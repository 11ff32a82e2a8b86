//! 本地缓冲内存实现

use crate::error::BufferError;
use crate::eviction::{EvictionCandidate, EvictionReport, report_eviction, select_victims};
use crate::models::{
    BufferBatch, BufferOptions, BufferPayload, BufferRecord, BufferStatus, RecordKind,
    analytics_size, telemetry_size,
};
use crate::traits::LocalBuffer;
use domain::{AnalyticsResult, TelemetryPoint, now_epoch_ms};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone)]
struct Entry {
    payload: BufferPayload,
    created_at_ms: i64,
    processed: bool,
    batch_id: Option<String>,
    size_bytes: i64,
}

#[derive(Debug, Default)]
struct State {
    telemetry: BTreeMap<i64, Entry>,
    analytics: BTreeMap<i64, Entry>,
    next_telemetry_id: i64,
    next_analytics_id: i64,
    total_size_bytes: i64,
    last_cleanup_ms: Option<i64>,
    closed: bool,
}

impl State {
    fn table(&mut self, kind: RecordKind) -> &mut BTreeMap<i64, Entry> {
        match kind {
            RecordKind::Telemetry => &mut self.telemetry,
            RecordKind::Analytics => &mut self.analytics,
        }
    }

    fn insert(&mut self, payload: BufferPayload, size_bytes: i64, created_at_ms: i64) -> i64 {
        let kind = payload.kind();
        let id = match kind {
            RecordKind::Telemetry => {
                self.next_telemetry_id += 1;
                self.next_telemetry_id
            }
            RecordKind::Analytics => {
                self.next_analytics_id += 1;
                self.next_analytics_id
            }
        };
        self.table(kind).insert(
            id,
            Entry {
                payload,
                created_at_ms,
                processed: false,
                batch_id: None,
                size_bytes,
            },
        );
        self.total_size_bytes += size_bytes;
        id
    }

    fn remove_where(&mut self, mut predicate: impl FnMut(&Entry) -> bool) -> (u64, i64) {
        let mut removed = 0u64;
        let mut freed = 0i64;
        for kind in RecordKind::all() {
            self.table(kind).retain(|_, entry| {
                if predicate(entry) {
                    removed += 1;
                    freed += entry.size_bytes;
                    false
                } else {
                    true
                }
            });
        }
        self.total_size_bytes -= freed;
        (removed, freed)
    }

    fn candidates(&self) -> Vec<EvictionCandidate> {
        let telemetry = self.telemetry.iter().map(|(id, e)| (RecordKind::Telemetry, *id, e));
        let analytics = self.analytics.iter().map(|(id, e)| (RecordKind::Analytics, *id, e));
        telemetry
            .chain(analytics)
            .map(|(kind, id, entry)| EvictionCandidate {
                kind,
                id,
                size_bytes: entry.size_bytes,
                processed: entry.processed,
                created_at_ms: entry.created_at_ms,
            })
            .collect()
    }
}

fn to_record(id: i64, entry: &Entry) -> BufferRecord {
    BufferRecord {
        id,
        payload: entry.payload.clone(),
        created_at_ms: entry.created_at_ms,
        processed: entry.processed,
        batch_id: entry.batch_id.clone(),
        size_bytes: entry.size_bytes,
    }
}

/// 本地缓冲内存存储
pub struct InMemoryBuffer {
    options: BufferOptions,
    state: Mutex<State>,
    fail_writes: AtomicBool,
}

impl InMemoryBuffer {
    pub fn new(options: BufferOptions) -> Self {
        Self {
            options,
            state: Mutex::new(State::default()),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// 模拟存储 I/O 故障（用于测试）。
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// 当前记录总数（用于测试）。
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.telemetry.len() + state.analytics.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, BufferError> {
        let state = self
            .state
            .lock()
            .map_err(|_| BufferError::storage("lock failed"))?;
        if state.closed {
            return Err(BufferError::Closed);
        }
        Ok(state)
    }

    fn check_writable(&self) -> Result<(), BufferError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(BufferError::storage("simulated write failure"));
        }
        Ok(())
    }

    fn evict(&self, state: &mut State) -> EvictionReport {
        let max_bytes = self.options.max_size_bytes();
        let mut report = EvictionReport::default();
        if state.total_size_bytes <= max_bytes {
            return report;
        }
        let excess = state.total_size_bytes - max_bytes;
        let victims = select_victims(&state.candidates(), &self.options.eviction, excess);
        for victim in &victims {
            if let Some(entry) = state.table(victim.kind).remove(&victim.id) {
                state.total_size_bytes -= entry.size_bytes;
                report.count(victim);
            }
        }
        report_eviction(&report, state.total_size_bytes, max_bytes);
        report
    }

    fn save_payloads(&self, payloads: Vec<(BufferPayload, i64)>) -> Result<Vec<i64>, BufferError> {
        self.check_writable()?;
        let mut state = self.lock()?;
        let now = now_epoch_ms();
        let ids = payloads
            .into_iter()
            .map(|(payload, size)| state.insert(payload, size, now))
            .collect();
        self.evict(&mut state);
        Ok(ids)
    }
}

impl Default for InMemoryBuffer {
    fn default() -> Self {
        Self::new(BufferOptions::default())
    }
}

fn analytics_payload(result: &AnalyticsResult) -> Result<(BufferPayload, i64), BufferError> {
    let metrics_json = serde_json::to_string(&result.metrics)?;
    let size = analytics_size(result, &metrics_json);
    Ok((BufferPayload::Analytics(result.clone()), size))
}

#[async_trait::async_trait]
impl LocalBuffer for InMemoryBuffer {
    async fn save_point(&self, point: &TelemetryPoint) -> Result<i64, BufferError> {
        let size = telemetry_size(point);
        let ids = self.save_payloads(vec![(BufferPayload::Telemetry(point.clone()), size)])?;
        ids.first().copied().ok_or_else(|| BufferError::storage("insert failed"))
    }

    async fn save_analytics(&self, result: &AnalyticsResult) -> Result<i64, BufferError> {
        let ids = self.save_payloads(vec![analytics_payload(result)?])?;
        ids.first().copied().ok_or_else(|| BufferError::storage("insert failed"))
    }

    async fn save_batch(
        &self,
        points: &[TelemetryPoint],
        results: &[AnalyticsResult],
    ) -> Result<usize, BufferError> {
        let mut payloads = Vec::with_capacity(points.len() + results.len());
        for point in points {
            payloads.push((BufferPayload::Telemetry(point.clone()), telemetry_size(point)));
        }
        for result in results {
            payloads.push(analytics_payload(result)?);
        }
        Ok(self.save_payloads(payloads)?.len())
    }

    async fn get_batch(
        &self,
        kind: RecordKind,
        max_size: usize,
    ) -> Result<Option<BufferBatch>, BufferError> {
        let mut state = self.lock()?;
        let batch_id = uuid::Uuid::new_v4().to_string();
        let mut records = Vec::new();
        for (id, entry) in state.table(kind).iter_mut() {
            if records.len() >= max_size {
                break;
            }
            if entry.processed {
                continue;
            }
            entry.batch_id = Some(batch_id.clone());
            records.push(to_record(*id, entry));
        }
        if records.is_empty() {
            return Ok(None);
        }
        Ok(Some(BufferBatch {
            batch_id,
            kind,
            records,
        }))
    }

    async fn get_batch_by_id(&self, batch_id: &str) -> Result<Vec<BufferRecord>, BufferError> {
        let state = self.lock()?;
        let telemetry = state.telemetry.iter();
        let analytics = state.analytics.iter();
        Ok(telemetry
            .chain(analytics)
            .filter(|(_, entry)| entry.batch_id.as_deref() == Some(batch_id))
            .map(|(id, entry)| to_record(*id, entry))
            .collect())
    }

    async fn mark_processed(&self, batch_id: &str) -> Result<u64, BufferError> {
        self.check_writable()?;
        let mut state = self.lock()?;
        let mut updated = 0u64;
        for kind in RecordKind::all() {
            for entry in state.table(kind).values_mut() {
                if entry.batch_id.as_deref() == Some(batch_id) {
                    entry.processed = true;
                    updated += 1;
                }
            }
        }
        Ok(updated)
    }

    async fn delete_batch(&self, batch_id: &str) -> Result<u64, BufferError> {
        self.check_writable()?;
        let mut state = self.lock()?;
        let (removed, _) = state
            .remove_where(|entry| entry.processed && entry.batch_id.as_deref() == Some(batch_id));
        Ok(removed)
    }

    async fn get_buffer_status(&self) -> Result<BufferStatus, BufferError> {
        let state = self.lock()?;
        let count = |table: &BTreeMap<i64, Entry>, processed: bool| {
            table.values().filter(|e| e.processed == processed).count() as u64
        };
        let oldest_pending_ms = state
            .telemetry
            .values()
            .chain(state.analytics.values())
            .filter(|e| !e.processed)
            .map(|e| e.created_at_ms)
            .min();
        let status = BufferStatus {
            telemetry_pending: count(&state.telemetry, false),
            telemetry_processed: count(&state.telemetry, true),
            analytics_pending: count(&state.analytics, false),
            analytics_processed: count(&state.analytics, true),
            oldest_pending_ms,
            last_cleanup_ms: state.last_cleanup_ms,
            ..BufferStatus::default()
        };
        Ok(status.with_size(state.total_size_bytes, self.options.max_size_mb))
    }

    async fn enforce_size_limit(&self) -> Result<EvictionReport, BufferError> {
        let mut state = self.lock()?;
        Ok(self.evict(&mut state))
    }

    async fn cleanup_processed_older_than(&self, cutoff_ms: i64) -> Result<u64, BufferError> {
        self.check_writable()?;
        let mut state = self.lock()?;
        let (removed, _) =
            state.remove_where(|entry| entry.processed && entry.created_at_ms < cutoff_ms);
        state.last_cleanup_ms = Some(now_epoch_ms());
        Ok(removed)
    }

    async fn close(&self) -> Result<(), BufferError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| BufferError::storage("lock failed"))?;
        state.closed = true;
        Ok(())
    }
}
