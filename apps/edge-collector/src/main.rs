//! OPC UA 边缘采集服务
//!
//! 启动顺序：日志 → 配置 → 资产清单 → 本地缓冲 → 各资产连接/分析任务 → 上传与清理循环 → HTTP 状态接口。
//! Ctrl-C 后广播停机信号，在宽限期内等待任务退出，最后关闭缓冲。

mod handlers;
mod routes;
mod runtime;
mod state;
mod utils;

use edge_config::AppConfig;
use edge_telemetry::init_tracing;
use edge_upload::UploadCoordinator;
use state::AppState;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 加载本地 .env（如存在），便于直接 cargo run 启动
    dotenvy::dotenv().ok();
    init_tracing();
    let config = AppConfig::from_env()?;
    let assets = config.load_assets()?;
    info!(
        target: "edge.app",
        enterprise = %config.enterprise,
        assets = assets.len(),
        http_addr = %config.http_addr,
        "edge_collector_starting"
    );

    let buffer = runtime::open_buffer(&config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    let connector = runtime::build_connector(&config);
    let settings = runtime::connection_settings(&config);
    let pipeline_config = runtime::pipeline_config(&config);
    let mut handles = Vec::with_capacity(assets.len());
    for asset in assets {
        let (handle, asset_tasks) = runtime::spawn_asset(
            asset,
            settings.clone(),
            connector.clone(),
            buffer.clone(),
            pipeline_config.clone(),
            config.channel_capacity,
            shutdown_rx.clone(),
        );
        handles.push(handle);
        tasks.extend(asset_tasks);
    }

    let (sink, sink_eventloop) = runtime::build_sink(&config);
    let upload = Arc::new(UploadCoordinator::new(
        buffer.clone(),
        sink,
        runtime::upload_config(&config),
    ));
    {
        let upload = upload.clone();
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { upload.run(shutdown).await }));
    }
    tasks.push(tokio::spawn(runtime::run_cleanup(
        buffer.clone(),
        Duration::from_secs(config.buffer_retention_hours.saturating_mul(3600)),
        Duration::from_secs(config.cleanup_interval_secs),
        shutdown_rx.clone(),
    )));

    let state = AppState {
        enterprise: config.enterprise.clone(),
        started_at: Instant::now(),
        assets: Arc::new(handles),
        buffer: buffer.clone(),
        upload,
    };
    let app = routes::create_router(state);
    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    info!(target: "edge.app", http_addr = %config.http_addr, "http_listening");

    let mut server_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                edge_ingest::wait_for_shutdown(&mut server_shutdown).await;
            })
            .await;
        if let Err(err) = result {
            warn!(target: "edge.app", error = %err, "http_server_failed");
        }
    });
    tasks.push(server);

    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(target: "edge.app", error = %err, "ctrl_c_listener_failed");
    }
    info!(target: "edge.app", "shutdown_requested");
    let _ = shutdown_tx.send(true);

    runtime::join_with_grace(tasks, Duration::from_secs(config.shutdown_grace_secs)).await;
    if let Some(eventloop) = sink_eventloop {
        eventloop.abort();
    }
    buffer.close().await?;
    info!(target: "edge.app", "edge_collector_stopped");
    Ok(())
}
