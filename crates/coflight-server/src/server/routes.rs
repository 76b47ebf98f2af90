use axum::{Json, Router, extract::Path, routing::get};
use core::time::Duration;
use serde::Serialize;
use serde_json::{Value, json};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TrackingStatus {
    tracking_number: String,
    status: &'static str,
    last_scan: &'static str,
}

/// Demo routes: a deliberately slow package-tracking lookup that makes
/// coalescing visible, plus a health probe.
pub fn router() -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/packages/track/{tracking_number}", get(track_package))
}

async fn health() -> Json<Value> {
    Json(json!({ "success": true, "message": "ok" }))
}

async fn track_package(Path(tracking_number): Path<String>) -> Json<Value> {
    tracing::info!(%tracking_number, "handler chain executing lookup");
    // Simulated repository latency; identical requests arriving in this
    // window share this one execution.
    tokio::time::sleep(Duration::from_millis(150)).await;

    let result = TrackingStatus {
        tracking_number,
        status: "In Transit",
        last_scan: "LAX outbound facility",
    };
    Json(json!({
        "success": true,
        "message": "Package tracked successfully",
        "result": result,
    }))
}
