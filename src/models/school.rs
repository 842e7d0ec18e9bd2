use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::provision::AcademicLevel;

/// A school is the tenant owner: at most one provisioned schema is bound to it.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct School {
    pub id: Uuid,
    pub name: String,
    pub academic_level: AcademicLevel,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterSchoolRequest {
    pub name: String,
    pub academic_level: AcademicLevel,
    pub registered_by: String,
}

#[derive(Debug, Serialize)]
pub struct RegisteredSchool {
    pub school: School,
    pub provision_id: Uuid,
    pub schema_name: String,
}
