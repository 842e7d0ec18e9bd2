use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::TenancyResult;

/// Answers whether an owning entity may currently receive traffic.
/// Callers bound the call with their own timeout.
#[async_trait]
pub trait OwnerActivityChecker: Send + Sync {
    async fn is_owner_active(&self, owner_id: Uuid) -> TenancyResult<bool>;
}

/// Schools are active unless suspended; unknown schools are inactive.
pub struct SchoolActivityChecker {
    pool: PgPool,
}

impl SchoolActivityChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OwnerActivityChecker for SchoolActivityChecker {
    async fn is_owner_active(&self, owner_id: Uuid) -> TenancyResult<bool> {
        let active: Option<bool> =
            sqlx::query_scalar("SELECT is_active FROM tenancy.schools WHERE id = $1")
                .bind(owner_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(active.unwrap_or(false))
    }
}
