//! 路由定义
//!
//! - 健康检查：/health
//! - 运行状态：/status
//! - 指标快照：/metrics

use axum::{
    Router,
    body::Body,
    http::{HeaderValue, Request},
    middleware::{self, Next},
    response::Response,
    routing::get,
};
use edge_telemetry::new_request_ids;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use crate::handlers::*;
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(get_status))
        .route("/metrics", get(get_metrics))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                // 注入 request_id/trace_id
                .layer(middleware::from_fn(request_context)),
        )
}

async fn request_context(mut req: Request<Body>, next: Next) -> Response {
    let ids = new_request_ids();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    req.extensions_mut().insert(ids.clone());

    let span = tracing::info_span!(
        "request",
        request_id = %ids.request_id,
        trace_id = %ids.trace_id,
        method = %method,
        path = %path
    );

    let mut response = next.run(req).instrument(span).await;
    response.headers_mut().insert(
        "x-request-id",
        HeaderValue::from_str(&ids.request_id).unwrap_or_else(|_| HeaderValue::from_static("")),
    );
    response.headers_mut().insert(
        "x-trace-id",
        HeaderValue::from_str(&ids.trace_id).unwrap_or_else(|_| HeaderValue::from_static("")),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::create_router;
    use crate::state::{AppState, AssetHandle};
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use domain::{Quality, TelemetryPoint, TelemetryValue};
    use edge_ingest::{ConnectionPhase, ConnectionState, SecurityPolicy};
    use edge_storage::{InMemoryBuffer, LocalBuffer};
    use edge_upload::{NoopSink, UploadConfig, UploadCoordinator};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Instant;
    use tokio::sync::watch;
    use tower::ServiceExt;

    fn handle(name: &str, phase: ConnectionPhase) -> AssetHandle {
        let mut state = ConnectionState::new(format!("opc.tcp://{name}:4840"));
        state.phase = phase;
        if phase == ConnectionPhase::Connected {
            state.security_policy = Some(SecurityPolicy::Basic256Sha256);
            state.connected_since_ms = Some(1_700_000_000_000);
        }
        let (_tx, rx) = watch::channel(state);
        AssetHandle {
            asset_name: name.to_string(),
            state: rx,
        }
    }

    fn app_state(assets: Vec<AssetHandle>, buffer: Arc<InMemoryBuffer>) -> AppState {
        let upload = UploadCoordinator::new(buffer.clone(), Arc::new(NoopSink), UploadConfig::default());
        AppState {
            enterprise: "GlobalCorp".to_string(),
            started_at: Instant::now(),
            assets: Arc::new(assets),
            buffer,
            upload: Arc::new(upload),
        }
    }

    async fn get_json(state: AppState, uri: &str) -> (StatusCode, Value, bool) {
        let response = create_router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).expect("request"))
            .await
            .expect("response");
        let status = response.status();
        let has_request_id = response.headers().contains_key("x-request-id");
        let body = response.into_body().collect().await.expect("body").to_bytes();
        let json = serde_json::from_slice(&body).expect("json");
        (status, json, has_request_id)
    }

    #[tokio::test]
    async fn health_reports_degraded_while_reconnecting() {
        let buffer = Arc::new(InMemoryBuffer::default());
        let state = app_state(
            vec![
                handle("Press_01", ConnectionPhase::Connected),
                handle("Oven_02", ConnectionPhase::ReconnectWait),
            ],
            buffer,
        );
        let (status, json, has_request_id) = get_json(state, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert!(has_request_id);
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["status"], "degraded");
        assert_eq!(json["data"]["assets"][1]["health"], "reconnecting");
    }

    #[tokio::test]
    async fn health_is_unavailable_when_every_asset_failed() {
        let buffer = Arc::new(InMemoryBuffer::default());
        let state = app_state(vec![handle("Press_01", ConnectionPhase::Failed)], buffer);
        let (status, json, _) = get_json(state, "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["data"]["status"], "unhealthy");
    }

    #[tokio::test]
    async fn status_lists_connections_and_buffer() {
        let buffer = Arc::new(InMemoryBuffer::default());
        let point = TelemetryPoint {
            ts_ms: 1_700_000_000_000,
            enterprise: "GlobalCorp".to_string(),
            site: "Dallas".to_string(),
            area: "Assembly".to_string(),
            line: "Line1".to_string(),
            machine: "Press_01".to_string(),
            tag: "power".to_string(),
            value: TelemetryValue::Float(12.0),
            unit: Some("kW".to_string()),
            quality: Quality::Good,
        };
        buffer.save_point(&point).await.expect("save");
        let state = app_state(vec![handle("Press_01", ConnectionPhase::Connected)], buffer);

        let (status, json, _) = get_json(state, "/status").await;
        assert_eq!(status, StatusCode::OK);
        let data = &json["data"];
        assert_eq!(data["enterprise"], "GlobalCorp");
        assert_eq!(data["assets"][0]["phase"], "connected");
        assert_eq!(data["assets"][0]["securityPolicy"], "Basic256Sha256");
        assert_eq!(data["buffer"]["telemetryPending"], 1);
        assert_eq!(data["upload"]["healthy"], true);
    }

    #[tokio::test]
    async fn status_survives_closed_buffer() {
        let buffer = Arc::new(InMemoryBuffer::default());
        buffer.close().await.expect("close");
        let state = app_state(Vec::new(), buffer);
        let (status, json, _) = get_json(state, "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["buffer"], Value::Null);
    }

    #[tokio::test]
    async fn metrics_returns_snapshot() {
        let buffer = Arc::new(InMemoryBuffer::default());
        let state = app_state(Vec::new(), buffer);
        let (status, json, _) = get_json(state, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(json["data"]["points_received"].is_u64());
    }
}
