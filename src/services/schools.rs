use std::sync::Arc;

use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{TenancyError, TenancyResult};
use crate::models::school::{RegisterSchoolRequest, RegisteredSchool, School};
use crate::services::orchestrator::ProvisioningOrchestrator;

const SCHOOL_SCHEMA_PREFIX: &str = "school";

/// School registration, suspension and removal, expressed in terms of the
/// provisioning orchestrator.
pub struct SchoolService {
    pool: PgPool,
    orchestrator: Arc<ProvisioningOrchestrator>,
}

impl SchoolService {
    pub fn new(pool: PgPool, orchestrator: Arc<ProvisioningOrchestrator>) -> Self {
        Self { pool, orchestrator }
    }

    /// Creates the school, provisions its schema and binds the two.
    ///
    /// When provisioning fails the school row is kept and the FAILED record is
    /// left for an operator to retry and assign.
    pub async fn register(&self, req: RegisterSchoolRequest) -> TenancyResult<RegisteredSchool> {
        if req.name.trim().is_empty() {
            return Err(TenancyError::InvalidArgument("school name is empty".into()));
        }
        let school = sqlx::query_as::<_, School>(
            "INSERT INTO tenancy.schools (name, academic_level)
             VALUES ($1, $2)
             RETURNING id, name, academic_level, is_active, created_at, updated_at",
        )
        .bind(req.name.trim())
        .bind(req.academic_level)
        .fetch_one(&self.pool)
        .await?;

        let record = self
            .orchestrator
            .create_provision(SCHOOL_SCHEMA_PREFIX, school.academic_level, &req.registered_by)
            .await
            .inspect_err(|e| warn!("School {} registered without a schema: {e}", school.id))?;

        let record = self
            .orchestrator
            .assign_provision_to_school(record.id, school.id, &req.registered_by)
            .await?;

        info!(
            "Registered school '{}' ({}) on {}",
            school.name, school.id, record.schema_name
        );
        Ok(RegisteredSchool {
            school,
            provision_id: record.id,
            schema_name: record.schema_name,
        })
    }

    pub async fn suspend(&self, school_id: Uuid) -> TenancyResult<School> {
        let school = self.set_active(school_id, false).await?;
        self.orchestrator.set_owner_access(school_id, false).await?;
        info!("Suspended school {school_id}");
        Ok(school)
    }

    pub async fn activate(&self, school_id: Uuid) -> TenancyResult<School> {
        let school = self.set_active(school_id, true).await?;
        self.orchestrator.set_owner_access(school_id, true).await?;
        info!("Activated school {school_id}");
        Ok(school)
    }

    /// Deletes the school's schema and record, then the school itself.
    pub async fn delete(&self, school_id: Uuid) -> TenancyResult<()> {
        self.set_active(school_id, false).await?;
        if let Some(record) = self.orchestrator.find_by_owner(school_id).await? {
            self.orchestrator.delete_provision(record.id).await?;
        }
        sqlx::query("DELETE FROM tenancy.schools WHERE id = $1")
            .bind(school_id)
            .execute(&self.pool)
            .await?;
        info!("Deleted school {school_id}");
        Ok(())
    }

    async fn set_active(&self, school_id: Uuid, active: bool) -> TenancyResult<School> {
        sqlx::query_as::<_, School>(
            "UPDATE tenancy.schools SET is_active = $2, updated_at = NOW()
             WHERE id = $1
             RETURNING id, name, academic_level, is_active, created_at, updated_at",
        )
        .bind(school_id)
        .bind(active)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(TenancyError::SchoolNotFound(school_id))
    }
}

#[cfg(test)]
mod tests {
    use sqlx::postgres::PgPoolOptions;

    use super::*;
    use crate::models::provision::AcademicLevel;
    use crate::testing::Harness;

    #[tokio::test]
    async fn blank_names_are_rejected_before_touching_the_database() {
        let h = Harness::new();
        let pool = PgPoolOptions::new()
            .connect_lazy(&h.config.database_url)
            .unwrap();
        let schools = SchoolService::new(pool, h.orchestrator.clone());

        let err = schools
            .register(RegisterSchoolRequest {
                name: "   ".into(),
                academic_level: AcademicLevel::Primary,
                registered_by: "ops".into(),
            })
            .await
            .unwrap_err();

        assert_eq!(err.code(), "INVALID_ARGUMENT");
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
        assert_eq!(h.orchestrator.get_stats().await.unwrap().total, 0);
    }
}
