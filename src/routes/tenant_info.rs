use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::{error::TenancyResult, middleware::tenant::TenantContext, AppState};

/// Echoes how the request was routed, as seen from inside the database.
pub async fn get_tenant_info(
    State(state): State<AppState>,
    tenant: TenantContext,
) -> TenancyResult<Json<Value>> {
    let mut tx = tenant.begin(&state.db).await?;
    let current_schema: Option<String> = sqlx::query_scalar("SELECT current_schema()::TEXT")
        .fetch_one(&mut *tx)
        .await?;
    tx.commit().await?;

    Ok(Json(json!({
        "owner_id": tenant.owner_id(),
        "schema": tenant.schema(),
        "current_schema": current_schema,
    })))
}
