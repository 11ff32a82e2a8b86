//! SQLite 本地缓冲实现

use crate::connection::connect_sqlite;
use crate::error::BufferError;
use crate::eviction::{EvictionCandidate, EvictionPhase, EvictionReport, KindPreference, report_eviction};
use crate::models::{
    BufferBatch, BufferOptions, BufferPayload, BufferRecord, BufferStatus, RecordKind,
    analytics_size, telemetry_size,
};
use crate::sqlite::schema::{META_LAST_CLEANUP, META_TOTAL_SIZE, SCHEMA};
use crate::traits::LocalBuffer;
use domain::{AnalyticsResult, Quality, TelemetryPoint, TelemetryValue, now_epoch_ms};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, Transaction};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// 单次淘汰查询的候选条数。
const EVICTION_CHUNK: i64 = 500;

fn table_name(kind: RecordKind) -> &'static str {
    match kind {
        RecordKind::Telemetry => "telemetry",
        RecordKind::Analytics => "analytics",
    }
}

fn split_value(value: &TelemetryValue) -> (Option<f64>, Option<String>, Option<i64>) {
    match value {
        TelemetryValue::Float(v) => (Some(*v), None, None),
        TelemetryValue::String(v) => (None, Some(v.clone()), None),
        TelemetryValue::Bool(v) => (None, None, Some(i64::from(*v))),
    }
}

fn join_value(
    value_float: Option<f64>,
    value_string: Option<String>,
    value_bool: Option<i64>,
) -> TelemetryValue {
    match (value_bool, value_float, value_string) {
        (Some(flag), _, _) => TelemetryValue::Bool(flag != 0),
        (None, Some(number), _) => TelemetryValue::Float(number),
        (None, None, text) => TelemetryValue::String(text.unwrap_or_default()),
    }
}

fn telemetry_from_row(row: &SqliteRow) -> Result<BufferRecord, BufferError> {
    let quality: String = row.try_get("quality")?;
    let point = TelemetryPoint {
        ts_ms: row.try_get("timestamp")?,
        enterprise: row.try_get("enterprise")?,
        site: row.try_get("site")?,
        area: row.try_get("area")?,
        line: row.try_get("line")?,
        machine: row.try_get("machine")?,
        tag: row.try_get("tag")?,
        value: join_value(
            row.try_get("value_float")?,
            row.try_get("value_string")?,
            row.try_get("value_bool")?,
        ),
        unit: row.try_get("unit")?,
        quality: quality.parse().unwrap_or(Quality::Uncertain),
    };
    Ok(BufferRecord {
        id: row.try_get("id")?,
        payload: BufferPayload::Telemetry(point),
        created_at_ms: row.try_get("created_at")?,
        processed: row.try_get::<i64, _>("processed")? != 0,
        batch_id: row.try_get("batch_id")?,
        size_bytes: row.try_get("size_bytes")?,
    })
}

fn analytics_from_row(row: &SqliteRow) -> Result<BufferRecord, BufferError> {
    let analytics_type: String = row.try_get("analytics_type")?;
    let metrics_json: String = row.try_get("metrics_json")?;
    let result = AnalyticsResult {
        ts_ms: row.try_get("timestamp")?,
        asset_id: row.try_get("asset_id")?,
        analytics_type: analytics_type
            .parse()
            .map_err(BufferError::Serialization)?,
        metrics: serde_json::from_str(&metrics_json)?,
        score: row.try_get("score")?,
    };
    Ok(BufferRecord {
        id: row.try_get("id")?,
        payload: BufferPayload::Analytics(result),
        created_at_ms: row.try_get("created_at")?,
        processed: row.try_get::<i64, _>("processed")? != 0,
        batch_id: row.try_get("batch_id")?,
        size_bytes: row.try_get("size_bytes")?,
    })
}

fn record_from_row(kind: RecordKind, row: &SqliteRow) -> Result<BufferRecord, BufferError> {
    match kind {
        RecordKind::Telemetry => telemetry_from_row(row),
        RecordKind::Analytics => analytics_from_row(row),
    }
}

async fn insert_point(
    tx: &mut Transaction<'static, Sqlite>,
    point: &TelemetryPoint,
    created_at: i64,
) -> Result<(i64, i64), BufferError> {
    let size = telemetry_size(point);
    let (value_float, value_string, value_bool) = split_value(&point.value);
    let done = sqlx::query(
        "insert into telemetry (timestamp, enterprise, site, area, line, machine, tag, \
         value_float, value_string, value_bool, unit, quality, processed, created_at, size_bytes) \
         values (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)",
    )
    .bind(point.ts_ms)
    .bind(&point.enterprise)
    .bind(&point.site)
    .bind(&point.area)
    .bind(&point.line)
    .bind(&point.machine)
    .bind(&point.tag)
    .bind(value_float)
    .bind(value_string)
    .bind(value_bool)
    .bind(&point.unit)
    .bind(point.quality.as_str())
    .bind(created_at)
    .bind(size)
    .execute(&mut **tx)
    .await?;
    Ok((done.last_insert_rowid(), size))
}

async fn insert_analytics(
    tx: &mut Transaction<'static, Sqlite>,
    result: &AnalyticsResult,
    created_at: i64,
) -> Result<(i64, i64), BufferError> {
    let metrics_json = serde_json::to_string(&result.metrics)?;
    let size = analytics_size(result, &metrics_json);
    let done = sqlx::query(
        "insert into analytics (timestamp, asset_id, analytics_type, metrics_json, score, \
         processed, created_at, size_bytes) values (?, ?, ?, ?, ?, 0, ?, ?)",
    )
    .bind(result.ts_ms)
    .bind(&result.asset_id)
    .bind(result.analytics_type.as_str())
    .bind(metrics_json)
    .bind(result.score)
    .bind(created_at)
    .bind(size)
    .execute(&mut **tx)
    .await?;
    Ok((done.last_insert_rowid(), size))
}

async fn write_meta(
    tx: &mut Transaction<'static, Sqlite>,
    key: &str,
    value: i64,
) -> Result<(), BufferError> {
    sqlx::query(
        "insert into buffer_metadata (key, value) values (?, ?) \
         on conflict(key) do update set value = excluded.value",
    )
    .bind(key)
    .bind(value.to_string())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn phase_sql(phase: &EvictionPhase) -> String {
    let filter = match phase.processed {
        Some(true) => "processed = 1",
        Some(false) => "processed = 0",
        None => "1 = 1",
    };
    let order = match phase.kind {
        KindPreference::Oldest => "created_at, kind_rank desc, id",
        KindPreference::TelemetryFirst => "kind_rank, created_at, id",
        KindPreference::AnalyticsFirst => "kind_rank desc, created_at, id",
    };
    format!(
        "select kind, id, size_bytes, processed, created_at from ( \
           select 'telemetry' as kind, 0 as kind_rank, id, size_bytes, processed, created_at from telemetry \
           union all \
           select 'analytics' as kind, 1 as kind_rank, id, size_bytes, processed, created_at from analytics \
         ) where {filter} order by {order} limit ?"
    )
}

async fn delete_ids(
    tx: &mut Transaction<'static, Sqlite>,
    kind: RecordKind,
    ids: &[i64],
) -> Result<(), BufferError> {
    if ids.is_empty() {
        return Ok(());
    }
    let mut builder: QueryBuilder<Sqlite> =
        QueryBuilder::new(format!("delete from {} where id in (", table_name(kind)));
    let mut separated = builder.separated(", ");
    for id in ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(")");
    builder.build().execute(&mut **tx).await?;
    Ok(())
}

/// SQLite 本地缓冲
///
/// 写路径由 `writer` 互斥锁串行化，锁内同时维护估算总字节数；
/// 所有变更与 `buffer_metadata` 更新处于同一事务。
pub struct SqliteBuffer {
    pool: SqlitePool,
    options: BufferOptions,
    writer: Mutex<i64>,
    closed: AtomicBool,
}

impl SqliteBuffer {
    /// 打开（或创建）缓冲库，并按现有记录重新计算总字节数。
    pub async fn open(path: impl AsRef<Path>, options: BufferOptions) -> Result<Self, BufferError> {
        let pool = connect_sqlite(path.as_ref()).await?;
        Self::with_pool(pool, options).await
    }

    pub async fn with_pool(pool: SqlitePool, options: BufferOptions) -> Result<Self, BufferError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        let total: i64 = sqlx::query_scalar(
            "select coalesce((select sum(size_bytes) from telemetry), 0) \
             + coalesce((select sum(size_bytes) from analytics), 0)",
        )
        .fetch_one(&pool)
        .await?;
        let mut tx = pool.begin().await?;
        write_meta(&mut tx, META_TOTAL_SIZE, total).await?;
        tx.commit().await?;

        info!(
            target: "edge.buffer",
            total_size_bytes = total,
            max_size_mb = options.max_size_mb,
            "buffer_opened"
        );
        Ok(Self {
            pool,
            options,
            writer: Mutex::new(total),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), BufferError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BufferError::Closed);
        }
        Ok(())
    }

    async fn save_all(
        &self,
        points: &[TelemetryPoint],
        results: &[AnalyticsResult],
    ) -> Result<Vec<i64>, BufferError> {
        self.ensure_open()?;
        let mut total = self.writer.lock().await;
        let created_at = now_epoch_ms();
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(points.len() + results.len());
        let mut added = 0i64;
        for point in points {
            let (id, size) = insert_point(&mut tx, point, created_at).await?;
            ids.push(id);
            added += size;
        }
        for result in results {
            let (id, size) = insert_analytics(&mut tx, result, created_at).await?;
            ids.push(id);
            added += size;
        }
        write_meta(&mut tx, META_TOTAL_SIZE, *total + added).await?;
        tx.commit().await?;
        *total += added;

        // 已提交即视为写入成功；淘汰失败留给清理循环处理
        if *total > self.options.max_size_bytes()
            && let Err(err) = self.evict_locked(&mut total).await
        {
            warn!(
                target: "edge.buffer",
                error = %err,
                size_bytes = *total,
                "eviction_after_save_failed"
            );
        }
        Ok(ids)
    }

    async fn evict_locked(&self, total: &mut i64) -> Result<EvictionReport, BufferError> {
        let max_bytes = self.options.max_size_bytes();
        let mut report = EvictionReport::default();
        let excess = *total - max_bytes;
        if excess <= 0 {
            return Ok(report);
        }
        let mut tx = self.pool.begin().await?;
        for phase in self.options.eviction.phases() {
            let sql = phase_sql(&phase);
            while report.bytes_freed < excess {
                let rows = sqlx::query(&sql)
                    .bind(EVICTION_CHUNK)
                    .fetch_all(&mut *tx)
                    .await?;
                if rows.is_empty() {
                    break;
                }
                let mut telemetry_ids = Vec::new();
                let mut analytics_ids = Vec::new();
                for row in &rows {
                    if report.bytes_freed >= excess {
                        break;
                    }
                    let kind: String = row.try_get("kind")?;
                    let kind = if kind == "telemetry" {
                        RecordKind::Telemetry
                    } else {
                        RecordKind::Analytics
                    };
                    let candidate = EvictionCandidate {
                        kind,
                        id: row.try_get("id")?,
                        size_bytes: row.try_get("size_bytes")?,
                        processed: row.try_get::<i64, _>("processed")? != 0,
                        created_at_ms: row.try_get("created_at")?,
                    };
                    match kind {
                        RecordKind::Telemetry => telemetry_ids.push(candidate.id),
                        RecordKind::Analytics => analytics_ids.push(candidate.id),
                    }
                    report.count(&candidate);
                }
                delete_ids(&mut tx, RecordKind::Telemetry, &telemetry_ids).await?;
                delete_ids(&mut tx, RecordKind::Analytics, &analytics_ids).await?;
            }
        }
        write_meta(&mut tx, META_TOTAL_SIZE, *total - report.bytes_freed).await?;
        tx.commit().await?;
        *total -= report.bytes_freed;
        report_eviction(&report, *total, max_bytes);
        Ok(report)
    }

    async fn read_meta(&self, key: &str) -> Result<Option<i64>, BufferError> {
        let value: Option<String> =
            sqlx::query_scalar("select value from buffer_metadata where key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value.and_then(|raw| raw.parse().ok()))
    }

    async fn count(&self, kind: RecordKind, processed: bool) -> Result<u64, BufferError> {
        let sql = format!(
            "select count(*) from {} where processed = ?",
            table_name(kind)
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(i64::from(processed))
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

#[async_trait::async_trait]
impl LocalBuffer for SqliteBuffer {
    async fn save_point(&self, point: &TelemetryPoint) -> Result<i64, BufferError> {
        let ids = self.save_all(std::slice::from_ref(point), &[]).await?;
        ids.first().copied().ok_or_else(|| BufferError::storage("insert failed"))
    }

    async fn save_analytics(&self, result: &AnalyticsResult) -> Result<i64, BufferError> {
        let ids = self.save_all(&[], std::slice::from_ref(result)).await?;
        ids.first().copied().ok_or_else(|| BufferError::storage("insert failed"))
    }

    async fn save_batch(
        &self,
        points: &[TelemetryPoint],
        results: &[AnalyticsResult],
    ) -> Result<usize, BufferError> {
        if points.is_empty() && results.is_empty() {
            return Ok(0);
        }
        Ok(self.save_all(points, results).await?.len())
    }

    async fn get_batch(
        &self,
        kind: RecordKind,
        max_size: usize,
    ) -> Result<Option<BufferBatch>, BufferError> {
        self.ensure_open()?;
        let _writer = self.writer.lock().await;
        let table = table_name(kind);
        let batch_id = uuid::Uuid::new_v4().to_string();
        let mut tx = self.pool.begin().await?;
        let tagged = sqlx::query(&format!(
            "update {table} set batch_id = ? where id in \
             (select id from {table} where processed = 0 order by id limit ?)"
        ))
        .bind(&batch_id)
        .bind(max_size as i64)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if tagged == 0 {
            tx.commit().await?;
            return Ok(None);
        }
        let rows = sqlx::query(&format!(
            "select * from {table} where batch_id = ? order by id"
        ))
        .bind(&batch_id)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        let records = rows
            .iter()
            .map(|row| record_from_row(kind, row))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(BufferBatch {
            batch_id,
            kind,
            records,
        }))
    }

    async fn get_batch_by_id(&self, batch_id: &str) -> Result<Vec<BufferRecord>, BufferError> {
        self.ensure_open()?;
        let mut records = Vec::new();
        for kind in RecordKind::all() {
            let rows = sqlx::query(&format!(
                "select * from {} where batch_id = ? order by id",
                table_name(kind)
            ))
            .bind(batch_id)
            .fetch_all(&self.pool)
            .await?;
            for row in &rows {
                records.push(record_from_row(kind, row)?);
            }
        }
        Ok(records)
    }

    async fn mark_processed(&self, batch_id: &str) -> Result<u64, BufferError> {
        self.ensure_open()?;
        let _writer = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;
        let mut updated = 0u64;
        for kind in RecordKind::all() {
            updated += sqlx::query(&format!(
                "update {} set processed = 1 where batch_id = ?",
                table_name(kind)
            ))
            .bind(batch_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        Ok(updated)
    }

    async fn delete_batch(&self, batch_id: &str) -> Result<u64, BufferError> {
        self.ensure_open()?;
        let mut total = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;
        let mut removed = 0u64;
        let mut freed = 0i64;
        for kind in RecordKind::all() {
            let sizes: Vec<i64> = sqlx::query_scalar(&format!(
                "delete from {} where batch_id = ? and processed = 1 returning size_bytes",
                table_name(kind)
            ))
            .bind(batch_id)
            .fetch_all(&mut *tx)
            .await?;
            removed += sizes.len() as u64;
            freed += sizes.iter().sum::<i64>();
        }
        write_meta(&mut tx, META_TOTAL_SIZE, *total - freed).await?;
        tx.commit().await?;
        *total -= freed;
        Ok(removed)
    }

    async fn get_buffer_status(&self) -> Result<BufferStatus, BufferError> {
        self.ensure_open()?;
        let total = *self.writer.lock().await;
        let oldest_pending_ms: Option<i64> = sqlx::query_scalar(
            "select min(created_at) from ( \
               select created_at from telemetry where processed = 0 \
               union all select created_at from analytics where processed = 0)",
        )
        .fetch_one(&self.pool)
        .await?;
        let status = BufferStatus {
            telemetry_pending: self.count(RecordKind::Telemetry, false).await?,
            telemetry_processed: self.count(RecordKind::Telemetry, true).await?,
            analytics_pending: self.count(RecordKind::Analytics, false).await?,
            analytics_processed: self.count(RecordKind::Analytics, true).await?,
            oldest_pending_ms,
            last_cleanup_ms: self.read_meta(META_LAST_CLEANUP).await?,
            ..BufferStatus::default()
        };
        Ok(status.with_size(total, self.options.max_size_mb))
    }

    async fn enforce_size_limit(&self) -> Result<EvictionReport, BufferError> {
        self.ensure_open()?;
        let mut total = self.writer.lock().await;
        self.evict_locked(&mut total).await
    }

    async fn cleanup_processed_older_than(&self, cutoff_ms: i64) -> Result<u64, BufferError> {
        self.ensure_open()?;
        let mut total = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;
        let mut removed = 0u64;
        let mut freed = 0i64;
        for kind in RecordKind::all() {
            let sizes: Vec<i64> = sqlx::query_scalar(&format!(
                "delete from {} where processed = 1 and created_at < ? returning size_bytes",
                table_name(kind)
            ))
            .bind(cutoff_ms)
            .fetch_all(&mut *tx)
            .await?;
            removed += sizes.len() as u64;
            freed += sizes.iter().sum::<i64>();
        }
        write_meta(&mut tx, META_TOTAL_SIZE, *total - freed).await?;
        write_meta(&mut tx, META_LAST_CLEANUP, now_epoch_ms()).await?;
        tx.commit().await?;
        *total -= freed;
        Ok(removed)
    }

    async fn close(&self) -> Result<(), BufferError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // 等待进行中的写入完成
        let _writer = self.writer.lock().await;
        if let Err(err) = sqlx::query("pragma wal_checkpoint(truncate)")
            .execute(&self.pool)
            .await
        {
            warn!(target: "edge.buffer", error = %err, "wal_checkpoint_failed");
        }
        self.pool.close().await;
        info!(target: "edge.buffer", "buffer_closed");
        Ok(())
    }
}
