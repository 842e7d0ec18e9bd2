use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use crate::{
    error::TenancyResult,
    middleware::super_admin::SuperAdminAuth,
    models::school::{RegisterSchoolRequest, RegisteredSchool, School},
    AppState,
};

pub async fn register_school(
    State(state): State<AppState>,
    _auth: SuperAdminAuth,
    Json(body): Json<RegisterSchoolRequest>,
) -> TenancyResult<(StatusCode, Json<RegisteredSchool>)> {
    let registered = state.schools.register(body).await?;
    Ok((StatusCode::CREATED, Json(registered)))
}

pub async fn suspend_school(
    State(state): State<AppState>,
    _auth: SuperAdminAuth,
    Path(id): Path<Uuid>,
) -> TenancyResult<Json<School>> {
    Ok(Json(state.schools.suspend(id).await?))
}

pub async fn activate_school(
    State(state): State<AppState>,
    _auth: SuperAdminAuth,
    Path(id): Path<Uuid>,
) -> TenancyResult<Json<School>> {
    Ok(Json(state.schools.activate(id).await?))
}

pub async fn delete_school(
    State(state): State<AppState>,
    _auth: SuperAdminAuth,
    Path(id): Path<Uuid>,
) -> TenancyResult<StatusCode> {
    state.schools.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
