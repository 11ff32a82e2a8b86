//! 健康检查
//!
//! - GET /health

use api_contract::{ApiResponse, HealthResponse, OverallStatus};
use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::{state::AppState, utils::response::asset_health};

pub async fn health(State(state): State<AppState>) -> Response {
    let assets: Vec<_> = state.assets.iter().map(asset_health).collect();
    let upload_healthy = state.upload.health_check();
    let status = OverallStatus::evaluate(&assets, upload_healthy);
    let code = match status {
        OverallStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    let response = HealthResponse {
        status,
        uptime_secs: state.started_at.elapsed().as_secs(),
        upload_healthy,
        assets,
    };
    (code, Json(ApiResponse::success(response))).into_response()
}
