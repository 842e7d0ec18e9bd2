use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};

use crate::AppState;

/// Reports database and cache reachability. Either one down is a 503.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let db = match sqlx::query("SELECT 1").execute(&state.db).await {
        Ok(_) => None,
        Err(e) => Some(e.to_string()),
    };
    let cache = state.cache_backend.ping().await.err().map(|e| e.to_string());

    let healthy = db.is_none() && cache.is_none();
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if healthy { "ok" } else { "error" },
            "db": db.unwrap_or_else(|| "connected".into()),
            "cache": cache.unwrap_or_else(|| "connected".into()),
        })),
    )
}
