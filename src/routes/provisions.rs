use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    db::migrations::MigrationReport,
    error::TenancyResult,
    middleware::super_admin::SuperAdminAuth,
    models::provision::{
        AssignProvisionRequest, ConsistencyReport, CreateProvisionRequest,
        CreateProvisionResponse, ProvisionFilter, ProvisionRecord, ProvisionStats, RepairAction,
        SweepReport,
    },
    AppState,
};

// ─── Provision CRUD ───────────────────────────────────────────────────────────

pub async fn create_provision(
    State(state): State<AppState>,
    _auth: SuperAdminAuth,
    Json(body): Json<CreateProvisionRequest>,
) -> TenancyResult<(StatusCode, Json<CreateProvisionResponse>)> {
    let record = state
        .orchestrator
        .create_provision(&body.schema_prefix, body.academic_level, &body.assigned_by)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateProvisionResponse {
            provision_id: record.id,
            message: format!("Schema {} provisioned", record.schema_name),
            schema_name: record.schema_name,
            status: record.status,
        }),
    ))
}

pub async fn list_provisions(
    State(state): State<AppState>,
    _auth: SuperAdminAuth,
    Query(filter): Query<ProvisionFilter>,
) -> TenancyResult<Json<Vec<ProvisionRecord>>> {
    Ok(Json(state.orchestrator.list_provisions(&filter).await?))
}

pub async fn get_stats(
    State(state): State<AppState>,
    _auth: SuperAdminAuth,
) -> TenancyResult<Json<ProvisionStats>> {
    Ok(Json(state.orchestrator.get_stats().await?))
}

pub async fn get_provision(
    State(state): State<AppState>,
    _auth: SuperAdminAuth,
    Path(id): Path<Uuid>,
) -> TenancyResult<Json<ProvisionRecord>> {
    Ok(Json(state.orchestrator.get_provision(id).await?))
}

pub async fn delete_provision(
    State(state): State<AppState>,
    _auth: SuperAdminAuth,
    Path(id): Path<Uuid>,
) -> TenancyResult<StatusCode> {
    state.orchestrator.delete_provision(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ─── Lifecycle ────────────────────────────────────────────────────────────────

pub async fn retry_provision(
    State(state): State<AppState>,
    _auth: SuperAdminAuth,
    Path(id): Path<Uuid>,
) -> TenancyResult<Json<ProvisionRecord>> {
    Ok(Json(state.orchestrator.retry_provisioning(id).await?))
}

pub async fn migrate_provision(
    State(state): State<AppState>,
    _auth: SuperAdminAuth,
    Path(id): Path<Uuid>,
) -> TenancyResult<Json<MigrationReport>> {
    Ok(Json(state.orchestrator.migrate_schema(id).await?))
}

pub async fn migrate_all(
    State(state): State<AppState>,
    _auth: SuperAdminAuth,
) -> TenancyResult<Json<SweepReport>> {
    Ok(Json(state.orchestrator.migrate_all_provisioned().await?))
}

pub async fn up_to_date(
    State(state): State<AppState>,
    _auth: SuperAdminAuth,
    Path(id): Path<Uuid>,
) -> TenancyResult<Json<serde_json::Value>> {
    let up_to_date = state.orchestrator.is_provision_up_to_date(id).await?;
    Ok(Json(serde_json::json!({ "provision_id": id, "up_to_date": up_to_date })))
}

pub async fn assign_provision(
    State(state): State<AppState>,
    _auth: SuperAdminAuth,
    Path(id): Path<Uuid>,
    Json(body): Json<AssignProvisionRequest>,
) -> TenancyResult<Json<ProvisionRecord>> {
    Ok(Json(
        state
            .orchestrator
            .assign_provision_to_school(id, body.owner_id, &body.assigned_by)
            .await?,
    ))
}

pub async fn unassign_provision(
    State(state): State<AppState>,
    _auth: SuperAdminAuth,
    Path(id): Path<Uuid>,
) -> TenancyResult<Json<ProvisionRecord>> {
    Ok(Json(state.orchestrator.unassign_provision(id).await?))
}

// ─── Sweeps ───────────────────────────────────────────────────────────────────

pub async fn list_orphaned_provisions(
    State(state): State<AppState>,
    _auth: SuperAdminAuth,
) -> TenancyResult<Json<Vec<ProvisionRecord>>> {
    Ok(Json(state.orchestrator.find_orphaned_provisions().await?))
}

pub async fn list_orphaned_schemas(
    State(state): State<AppState>,
    _auth: SuperAdminAuth,
) -> TenancyResult<Json<Vec<String>>> {
    Ok(Json(state.orchestrator.find_orphaned_schemas().await?))
}

pub async fn cleanup_orphaned_schemas(
    State(state): State<AppState>,
    _auth: SuperAdminAuth,
) -> TenancyResult<Json<SweepReport>> {
    Ok(Json(state.orchestrator.cleanup_all_orphaned_schemas().await?))
}

pub async fn recover_orphaned_provisions(
    State(state): State<AppState>,
    _auth: SuperAdminAuth,
) -> TenancyResult<Json<SweepReport>> {
    Ok(Json(
        state.orchestrator.recover_all_orphaned_provisions().await?,
    ))
}

#[derive(Debug, Deserialize)]
pub struct CleanupQuery {
    pub max_age_days: Option<i64>,
}

pub async fn cleanup_failed(
    State(state): State<AppState>,
    _auth: SuperAdminAuth,
    Query(query): Query<CleanupQuery>,
) -> TenancyResult<Json<SweepReport>> {
    let max_age_days = query
        .max_age_days
        .unwrap_or(state.config.failed_provision_max_age_days)
        .max(0);
    Ok(Json(
        state
            .orchestrator
            .cleanup_failed_provisions(max_age_days)
            .await?,
    ))
}

// ─── Consistency ──────────────────────────────────────────────────────────────

pub async fn check_consistency(
    State(state): State<AppState>,
    _auth: SuperAdminAuth,
    Path(schema): Path<String>,
) -> TenancyResult<Json<ConsistencyReport>> {
    Ok(Json(
        state.orchestrator.is_provision_consistent(&schema).await?,
    ))
}

pub async fn repair_consistency(
    State(state): State<AppState>,
    _auth: SuperAdminAuth,
    Path(schema): Path<String>,
) -> TenancyResult<Json<serde_json::Value>> {
    let action: RepairAction = state
        .orchestrator
        .repair_inconsistent_provision(&schema)
        .await?;
    Ok(Json(serde_json::json!({ "schema_name": schema, "action": action })))
}
