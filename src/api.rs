use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{dispatcher::Tool, AppState};

pub async fn healthz() -> impl IntoResponse {
    Json(json!({ "ok": true, "timestamp": Utc::now() }))
}

/// Ready when the cluster answers a health check through the governor and is not red.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let trace_id = Uuid::new_v4().to_string();
    let result = state
        .dispatcher
        .dispatch(Tool::GetClusterHealth.name(), &Value::Null, &trace_id)
        .await;

    match result {
        Ok(output) => {
            let status = output.payload["document"]["status"]
                .as_str()
                .unwrap_or("unknown")
                .to_string();
            let code = if status == "red" {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::OK
            };
            (
                code,
                Json(json!({
                    "ok": code == StatusCode::OK,
                    "cluster_status": status,
                    "timestamp": Utc::now(),
                })),
            )
        }
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "ok": false,
                "error": {
                    "kind": err.kind().as_str(),
                    "message": err.message(),
                    "traceId": trace_id,
                },
                "timestamp": Utc::now(),
            })),
        ),
    }
}
