//! 运行状态：各资产连接、本地缓冲、上传统计。
//!
//! - GET /status

use api_contract::{ApiResponse, StatusResponse};
use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::{
    state::AppState,
    utils::response::{asset_status, buffer_to_view, upload_to_view},
};

pub async fn get_status(State(state): State<AppState>) -> Response {
    let buffer = match state.buffer.get_buffer_status().await {
        Ok(status) => Some(buffer_to_view(status)),
        Err(err) => {
            warn!(target: "edge.http", error = %err, "buffer_status_unavailable");
            None
        }
    };
    let response = StatusResponse {
        enterprise: state.enterprise.clone(),
        assets: state.assets.iter().map(asset_status).collect(),
        buffer,
        upload: upload_to_view(state.upload.stats(), state.upload.health_check()),
    };
    (StatusCode::OK, Json(ApiResponse::success(response))).into_response()
}
