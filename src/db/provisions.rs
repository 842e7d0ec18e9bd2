use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{sqlstate, TenancyError, TenancyResult, UNIQUE_VIOLATION};
use crate::models::provision::{
    NewProvision, ProvisionFilter, ProvisionRecord, ProvisionStats, ProvisionStatus,
};

/// Durable provisioning records: the single source of truth for status,
/// owner assignment and attempt history.
///
/// Lookups return `Ok(None)` for absent rows; errors are reserved for the
/// store itself failing. Guarded transitions (`assign`, `unassign`,
/// `set_accessible`) return `Ok(None)` when the row no longer satisfies the
/// guard, so a concurrent writer is detected instead of overwritten.
#[async_trait]
pub trait ProvisionStore: Send + Sync {
    /// Fails with `ProvisionConflict` when the schema name is already recorded.
    async fn insert_pending(&self, new: NewProvision) -> TenancyResult<ProvisionRecord>;
    async fn find_by_id(&self, id: Uuid) -> TenancyResult<Option<ProvisionRecord>>;
    async fn find_by_schema(&self, schema: &str) -> TenancyResult<Option<ProvisionRecord>>;
    async fn find_by_owner(&self, owner_id: Uuid) -> TenancyResult<Option<ProvisionRecord>>;
    async fn list(&self, filter: &ProvisionFilter) -> TenancyResult<Vec<ProvisionRecord>>;

    async fn mark_provisioned(&self, id: Uuid) -> TenancyResult<ProvisionRecord>;
    /// Sets FAILED, stores the message, increments `attempts` and closes access.
    async fn mark_failed(&self, id: Uuid, message: &str) -> TenancyResult<ProvisionRecord>;
    async fn reset_to_pending(&self, id: Uuid) -> TenancyResult<ProvisionRecord>;

    /// Binds the owner and opens access in one write; requires PROVISIONED and unassigned.
    async fn assign(
        &self,
        id: Uuid,
        owner_id: Uuid,
        assigned_by: &str,
    ) -> TenancyResult<Option<ProvisionRecord>>;
    async fn unassign(&self, id: Uuid) -> TenancyResult<Option<ProvisionRecord>>;
    /// Opening access requires PROVISIONED and an assigned owner; closing always applies.
    async fn set_accessible(
        &self,
        id: Uuid,
        accessible: bool,
    ) -> TenancyResult<Option<ProvisionRecord>>;

    async fn delete(&self, id: Uuid) -> TenancyResult<bool>;
    async fn find_failed_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> TenancyResult<Vec<ProvisionRecord>>;
    async fn stats(&self) -> TenancyResult<ProvisionStats>;
}

const COLUMNS: &str = "id, schema_name, status, academic_level, assigned_owner_id, assigned_by,
    assigned_at, accessible, error_message, attempts, requested_by, created_at, updated_at";

pub struct PgProvisionStore {
    pool: PgPool,
}

impl PgProvisionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn update_returning(
        &self,
        id: Uuid,
        sql: &str,
    ) -> TenancyResult<ProvisionRecord> {
        sqlx::query_as::<_, ProvisionRecord>(sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| TenancyError::ProvisionNotFound(id.to_string()))
    }
}

#[async_trait]
impl ProvisionStore for PgProvisionStore {
    async fn insert_pending(&self, new: NewProvision) -> TenancyResult<ProvisionRecord> {
        sqlx::query_as::<_, ProvisionRecord>(&format!(
            "INSERT INTO tenancy.provisions (schema_name, status, academic_level, requested_by)
             VALUES ($1, 'pending', $2, $3)
             RETURNING {COLUMNS}"
        ))
        .bind(&new.schema_name)
        .bind(new.academic_level)
        .bind(&new.requested_by)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match sqlstate(&e).as_deref() {
            Some(UNIQUE_VIOLATION) => TenancyError::ProvisionConflict(format!(
                "a provisioning record for {} already exists",
                new.schema_name
            )),
            _ => TenancyError::Infrastructure(e),
        })
    }

    async fn find_by_id(&self, id: Uuid) -> TenancyResult<Option<ProvisionRecord>> {
        Ok(sqlx::query_as::<_, ProvisionRecord>(&format!(
            "SELECT {COLUMNS} FROM tenancy.provisions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn find_by_schema(&self, schema: &str) -> TenancyResult<Option<ProvisionRecord>> {
        Ok(sqlx::query_as::<_, ProvisionRecord>(&format!(
            "SELECT {COLUMNS} FROM tenancy.provisions WHERE schema_name = $1"
        ))
        .bind(schema)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn find_by_owner(&self, owner_id: Uuid) -> TenancyResult<Option<ProvisionRecord>> {
        Ok(sqlx::query_as::<_, ProvisionRecord>(&format!(
            "SELECT {COLUMNS} FROM tenancy.provisions WHERE assigned_owner_id = $1"
        ))
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn list(&self, filter: &ProvisionFilter) -> TenancyResult<Vec<ProvisionRecord>> {
        Ok(sqlx::query_as::<_, ProvisionRecord>(&format!(
            "SELECT {COLUMNS} FROM tenancy.provisions
             WHERE ($1::provision_status IS NULL OR status = $1)
               AND ($2::UUID IS NULL OR assigned_owner_id = $2)
             ORDER BY created_at"
        ))
        .bind(filter.status)
        .bind(filter.owner_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn mark_provisioned(&self, id: Uuid) -> TenancyResult<ProvisionRecord> {
        self.update_returning(
            id,
            &format!(
                "UPDATE tenancy.provisions SET
                   status = 'provisioned',
                   error_message = NULL,
                   updated_at = NOW()
                 WHERE id = $1
                 RETURNING {COLUMNS}"
            ),
        )
        .await
    }

    async fn mark_failed(&self, id: Uuid, message: &str) -> TenancyResult<ProvisionRecord> {
        sqlx::query_as::<_, ProvisionRecord>(&format!(
            "UPDATE tenancy.provisions SET
               status = 'failed',
               error_message = $2,
               attempts = attempts + 1,
               accessible = FALSE,
               updated_at = NOW()
             WHERE id = $1
             RETURNING {COLUMNS}"
        ))
        .bind(id)
        .bind(message)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| TenancyError::ProvisionNotFound(id.to_string()))
    }

    async fn reset_to_pending(&self, id: Uuid) -> TenancyResult<ProvisionRecord> {
        self.update_returning(
            id,
            &format!(
                "UPDATE tenancy.provisions SET
                   status = 'pending',
                   accessible = FALSE,
                   updated_at = NOW()
                 WHERE id = $1
                 RETURNING {COLUMNS}"
            ),
        )
        .await
    }

    async fn assign(
        &self,
        id: Uuid,
        owner_id: Uuid,
        assigned_by: &str,
    ) -> TenancyResult<Option<ProvisionRecord>> {
        sqlx::query_as::<_, ProvisionRecord>(&format!(
            "UPDATE tenancy.provisions SET
               assigned_owner_id = $2,
               assigned_by = $3,
               assigned_at = NOW(),
               accessible = TRUE,
               updated_at = NOW()
             WHERE id = $1
               AND status = 'provisioned'
               AND assigned_owner_id IS NULL
             RETURNING {COLUMNS}"
        ))
        .bind(id)
        .bind(owner_id)
        .bind(assigned_by)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| match sqlstate(&e).as_deref() {
            Some(UNIQUE_VIOLATION) => TenancyError::ProvisionConflict(format!(
                "owner {owner_id} is already bound to another schema"
            )),
            _ => TenancyError::Infrastructure(e),
        })
    }

    async fn unassign(&self, id: Uuid) -> TenancyResult<Option<ProvisionRecord>> {
        Ok(sqlx::query_as::<_, ProvisionRecord>(&format!(
            "UPDATE tenancy.provisions SET
               assigned_owner_id = NULL,
               assigned_by = NULL,
               assigned_at = NULL,
               accessible = FALSE,
               updated_at = NOW()
             WHERE id = $1 AND assigned_owner_id IS NOT NULL
             RETURNING {COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn set_accessible(
        &self,
        id: Uuid,
        accessible: bool,
    ) -> TenancyResult<Option<ProvisionRecord>> {
        Ok(sqlx::query_as::<_, ProvisionRecord>(&format!(
            "UPDATE tenancy.provisions SET
               accessible = $2,
               updated_at = NOW()
             WHERE id = $1
               AND (NOT $2 OR (status = 'provisioned' AND assigned_owner_id IS NOT NULL))
             RETURNING {COLUMNS}"
        ))
        .bind(id)
        .bind(accessible)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn delete(&self, id: Uuid) -> TenancyResult<bool> {
        let result = sqlx::query("DELETE FROM tenancy.provisions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_failed_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> TenancyResult<Vec<ProvisionRecord>> {
        Ok(sqlx::query_as::<_, ProvisionRecord>(&format!(
            "SELECT {COLUMNS} FROM tenancy.provisions
             WHERE status = 'failed' AND updated_at < $1
             ORDER BY updated_at"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn stats(&self) -> TenancyResult<ProvisionStats> {
        let rows: Vec<(ProvisionStatus, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*)::BIGINT FROM tenancy.provisions GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let count = |wanted: ProvisionStatus| {
            rows.iter()
                .find(|(status, _)| *status == wanted)
                .map(|(_, n)| *n)
                .unwrap_or(0)
        };
        Ok(ProvisionStats::from_counts(
            count(ProvisionStatus::Provisioned),
            count(ProvisionStatus::Pending),
            count(ProvisionStatus::Failed),
        ))
    }
}
