//! 缓冲库表结构

pub const META_TOTAL_SIZE: &str = "total_size_bytes";
pub const META_LAST_CLEANUP: &str = "last_cleanup_ms";

pub const SCHEMA: &[&str] = &[
    "create table if not exists telemetry (
        id integer primary key autoincrement,
        timestamp integer not null,
        enterprise text not null,
        site text not null,
        area text not null,
        line text not null,
        machine text not null,
        tag text not null,
        value_float real,
        value_string text,
        value_bool integer,
        unit text,
        quality text not null,
        processed integer not null default 0,
        batch_id text,
        created_at integer not null,
        size_bytes integer not null
    )",
    "create index if not exists idx_telemetry_pending on telemetry (processed, id)",
    "create index if not exists idx_telemetry_batch on telemetry (batch_id)",
    "create index if not exists idx_telemetry_created on telemetry (created_at)",
    "create table if not exists analytics (
        id integer primary key autoincrement,
        timestamp integer not null,
        asset_id text not null,
        analytics_type text not null,
        metrics_json text not null,
        score real,
        processed integer not null default 0,
        batch_id text,
        created_at integer not null,
        size_bytes integer not null
    )",
    "create index if not exists idx_analytics_pending on analytics (processed, id)",
    "create index if not exists idx_analytics_batch on analytics (batch_id)",
    "create index if not exists idx_analytics_created on analytics (created_at)",
    "create table if not exists buffer_metadata (
        key text primary key,
        value text not null
    )",
];
