//! Telemetry 指标快照。
//!
//! - GET /metrics

use api_contract::ApiResponse;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use edge_telemetry::metrics;

pub async fn get_metrics() -> Response {
    (StatusCode::OK, Json(ApiResponse::success(metrics().snapshot()))).into_response()
}
