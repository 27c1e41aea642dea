use axum::{
    Json, Router, debug_handler,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::{Value, json};
use sqlx::SqlitePool;
use tracing::warn;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(root))
        .route("/api/health/live", get(live))
        .route("/api/health/ready", get(ready))
}

#[debug_handler]
async fn root() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[debug_handler]
async fn live() -> Json<Value> {
    Json(json!({ "status": "ok", "check": "live" }))
}

/// Readiness probes the database; the presence registry is in-process and
/// cannot be down while we are answering.
#[debug_handler(state = crate::AppState)]
async fn ready(State(db_pool): State<SqlitePool>) -> Response {
    match sqlx::query("SELECT 1").execute(&db_pool).await {
        Ok(_) => Json(json!({
            "status": "ok",
            "check": "ready",
            "components": { "database": "ok", "cache": "ok" },
        }))
        .into_response(),
        Err(err) => {
            warn!(%err, "readiness probe failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "degraded",
                    "check": "ready",
                    "components": { "database": "error", "cache": "ok" },
                })),
            )
                .into_response()
        }
    }
}
