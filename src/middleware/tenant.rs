use axum::{
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap},
};
use sqlx::{pool::PoolConnection, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::db::schema_manager::{quote_ident, validate_schema_name};
use crate::error::{TenancyError, TenancyResult};
use crate::services::tenant_cache::TenantCache;
use crate::AppState;

pub const TENANT_HEADER: &str = "X-Tenant";

/// The schema a request is routed to.
///
/// Built once per request from the `X-Tenant` header (the owning school's
/// id). Without the header the request runs against the default schema. The
/// context never outlives the request: [`TenantContext::begin`] scopes the
/// search path to one transaction and pooled connections are reset when
/// they are released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    owner_id: Option<Uuid>,
    schema: String,
    default_schema: String,
}

impl TenantContext {
    pub fn for_default(default_schema: &str) -> Self {
        Self {
            owner_id: None,
            schema: default_schema.to_string(),
            default_schema: default_schema.to_string(),
        }
    }

    pub fn owner_id(&self) -> Option<Uuid> {
        self.owner_id
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn is_default(&self) -> bool {
        self.owner_id.is_none()
    }

    /// Tenant schema first, shared default schema second.
    pub fn search_path(&self) -> String {
        if self.schema == self.default_schema {
            quote_ident(&self.default_schema)
        } else {
            format!(
                "{}, {}",
                quote_ident(&self.schema),
                quote_ident(&self.default_schema)
            )
        }
    }

    pub async fn resolve(
        headers: &HeaderMap,
        cache: &TenantCache,
        default_schema: &str,
    ) -> TenancyResult<Self> {
        let Some(owner_id) = tenant_id_from_headers(headers)? else {
            return Ok(Self::for_default(default_schema));
        };

        let schema = cache.get_schema_for_school(owner_id).await?;
        // Cached values end up in the search path.
        validate_schema_name(&schema)?;
        tracing::debug!(tenant = %owner_id, schema = %schema, "Resolved tenant");

        Ok(Self {
            owner_id: Some(owner_id),
            schema,
            default_schema: default_schema.to_string(),
        })
    }

    /// Opens a transaction whose search path ends with it.
    pub async fn begin(&self, pool: &PgPool) -> TenancyResult<Transaction<'static, Postgres>> {
        let mut tx = pool.begin().await?;
        sqlx::query("SELECT set_config('search_path', $1, true)")
            .bind(self.search_path())
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }

    /// Checks out a connection routed for the whole checkout. The pool
    /// resets the search path when the connection is released.
    pub async fn acquire(&self, pool: &PgPool) -> TenancyResult<PoolConnection<Postgres>> {
        let mut conn = pool.acquire().await?;
        sqlx::query("SELECT set_config('search_path', $1, false)")
            .bind(self.search_path())
            .execute(&mut *conn)
            .await?;
        Ok(conn)
    }
}

/// Absent or blank header: `None`. Anything else must be exactly one UUID.
pub fn tenant_id_from_headers(headers: &HeaderMap) -> TenancyResult<Option<Uuid>> {
    let mut values = headers.get_all(TENANT_HEADER).iter();
    let Some(value) = values.next() else {
        return Ok(None);
    };
    if values.next().is_some() {
        return Err(TenancyError::InvalidTenantIdentifier(
            "multiple X-Tenant headers".into(),
        ));
    }

    let raw = value
        .to_str()
        .map_err(|_| TenancyError::InvalidTenantIdentifier("non-ASCII X-Tenant header".into()))?
        .trim();
    if raw.is_empty() {
        return Ok(None);
    }
    Uuid::parse_str(raw)
        .map(Some)
        .map_err(|_| TenancyError::InvalidTenantIdentifier(raw.to_string()))
}

impl FromRequestParts<AppState> for TenantContext {
    type Rejection = TenancyError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        TenantContext::resolve(&parts.headers, &state.cache, &state.config.default_schema).await
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;
    use crate::models::provision::AcademicLevel;
    use crate::testing::Harness;

    fn headers(values: &[&str]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for v in values {
            map.append(TENANT_HEADER, HeaderValue::from_str(v).unwrap());
        }
        map
    }

    #[test]
    fn header_parsing() {
        let id = Uuid::new_v4();
        assert_eq!(tenant_id_from_headers(&headers(&[])).unwrap(), None);
        assert_eq!(tenant_id_from_headers(&headers(&["  "])).unwrap(), None);
        assert_eq!(
            tenant_id_from_headers(&headers(&[&id.to_string()])).unwrap(),
            Some(id)
        );
        assert!(matches!(
            tenant_id_from_headers(&headers(&["school-a"])),
            Err(TenancyError::InvalidTenantIdentifier(_))
        ));
        assert!(matches!(
            tenant_id_from_headers(&headers(&[&id.to_string(), &id.to_string()])),
            Err(TenancyError::InvalidTenantIdentifier(_))
        ));
    }

    #[test]
    fn search_path_puts_tenant_before_default() {
        let ctx = TenantContext {
            owner_id: Some(Uuid::nil()),
            schema: "school_0a1b".into(),
            default_schema: "public".into(),
        };
        assert_eq!(ctx.search_path(), r#""school_0a1b", "public""#);
        assert_eq!(TenantContext::for_default("public").search_path(), r#""public""#);
    }

    #[tokio::test]
    async fn missing_header_routes_to_default_schema() {
        let h = Harness::new();
        let ctx = TenantContext::resolve(&HeaderMap::new(), &h.cache, "public")
            .await
            .unwrap();
        assert!(ctx.is_default());
        assert_eq!(ctx.schema(), "public");
    }

    #[tokio::test]
    async fn header_routes_to_the_owner_schema() {
        let h = Harness::new();
        let owner = Uuid::new_v4();
        h.checker.set_active(owner, true);
        let record = h
            .orchestrator
            .orchestrate_provisioning("school_routed", AcademicLevel::Primary, "ops")
            .await
            .unwrap();
        h.orchestrator
            .assign_provision_to_school(record.id, owner, "ops")
            .await
            .unwrap();

        let ctx = TenantContext::resolve(&headers(&[&owner.to_string()]), &h.cache, "public")
            .await
            .unwrap();
        assert_eq!(ctx.owner_id(), Some(owner));
        assert_eq!(ctx.schema(), "school_routed");
    }

    #[tokio::test]
    async fn unknown_tenant_is_denied_not_defaulted() {
        let h = Harness::new();
        let err = TenantContext::resolve(
            &headers(&[&Uuid::new_v4().to_string()]),
            &h.cache,
            "public",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TenancyError::AccessDenied(_)));
    }
}
