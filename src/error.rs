use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use uuid::Uuid;

/// Errors surfaced by the tenancy control plane.
///
/// Every variant carries a stable [`code`](TenancyError::code) so callers can
/// decide between retrying, surfacing and ignoring without matching messages.
#[derive(Debug, thiserror::Error)]
pub enum TenancyError {
    #[error("Schema already exists: {0}")]
    SchemaAlreadyExists(String),

    #[error("Schema not found: {0}")]
    SchemaNotFound(String),

    #[error("Provision not found: {0}")]
    ProvisionNotFound(String),

    #[error("School not found: {0}")]
    SchoolNotFound(Uuid),

    #[error("Invalid provision state: {0}")]
    InvalidProvisionState(String),

    /// A concurrent request created the same record first.
    #[error("Provision conflict: {0}")]
    ProvisionConflict(String),

    #[error("Provisioning of {schema} failed: {message}")]
    ProvisioningFailed { schema: String, message: String },

    #[error("Migration of {schema} failed: {message}")]
    MigrationFailed { schema: String, message: String },

    #[error("Protected resource: {0}")]
    ProtectedResource(String),

    #[error("Access denied for owner {0}")]
    AccessDenied(Uuid),

    #[error("Tenant role {role} error: {message}")]
    TenantRole { role: String, message: String },

    #[error("Invalid schema name: {0}")]
    InvalidSchemaName(String),

    #[error("Invalid tenant identifier: {0}")]
    InvalidTenantIdentifier(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Cache backend error: {0}")]
    Cache(String),

    #[error("Infrastructure error: {0}")]
    Infrastructure(#[from] sqlx::Error),
}

pub type TenancyResult<T> = Result<T, TenancyError>;

impl TenancyError {
    pub fn code(&self) -> &'static str {
        match self {
            TenancyError::SchemaAlreadyExists(_) => "SCHEMA_ALREADY_EXISTS",
            TenancyError::SchemaNotFound(_) => "SCHEMA_NOT_FOUND",
            TenancyError::ProvisionNotFound(_) => "PROVISION_NOT_FOUND",
            TenancyError::SchoolNotFound(_) => "SCHOOL_NOT_FOUND",
            TenancyError::InvalidProvisionState(_) => "INVALID_PROVISION_STATE",
            TenancyError::ProvisionConflict(_) => "PROVISION_CONFLICT",
            TenancyError::ProvisioningFailed { .. } => "PROVISIONING_FAILED",
            TenancyError::MigrationFailed { .. } => "MIGRATION_FAILED",
            TenancyError::ProtectedResource(_) => "PROTECTED_RESOURCE",
            TenancyError::AccessDenied(_) => "ACCESS_DENIED",
            TenancyError::TenantRole { .. } => "TENANT_ROLE_ERROR",
            TenancyError::InvalidSchemaName(_) => "INVALID_SCHEMA_NAME",
            TenancyError::InvalidTenantIdentifier(_) => "INVALID_TENANT_IDENTIFIER",
            TenancyError::InvalidArgument(_) => "INVALID_ARGUMENT",
            TenancyError::Cache(_) => "CACHE_ERROR",
            TenancyError::Infrastructure(_) => "INFRASTRUCTURE_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            TenancyError::SchemaAlreadyExists(_) | TenancyError::ProvisionConflict(_) => {
                StatusCode::CONFLICT
            }
            TenancyError::SchemaNotFound(_)
            | TenancyError::ProvisionNotFound(_)
            | TenancyError::SchoolNotFound(_) => StatusCode::NOT_FOUND,
            TenancyError::InvalidProvisionState(_) => StatusCode::CONFLICT,
            TenancyError::ProtectedResource(_) | TenancyError::AccessDenied(_) => {
                StatusCode::FORBIDDEN
            }
            TenancyError::InvalidSchemaName(_)
            | TenancyError::InvalidTenantIdentifier(_)
            | TenancyError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            TenancyError::ProvisioningFailed { .. }
            | TenancyError::MigrationFailed { .. }
            | TenancyError::TenantRole { .. }
            | TenancyError::Cache(_)
            | TenancyError::Infrastructure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Conflicts come from racing duplicate requests and are safe to retry
    /// after re-reading state.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            TenancyError::SchemaAlreadyExists(_) | TenancyError::ProvisionConflict(_)
        )
    }

    pub(crate) fn tenant_role(role: &str, source: impl std::fmt::Display) -> Self {
        TenancyError::TenantRole {
            role: role.to_string(),
            message: source.to_string(),
        }
    }
}

impl From<redis::RedisError> for TenancyError {
    fn from(e: redis::RedisError) -> Self {
        TenancyError::Cache(e.to_string())
    }
}

/// SQLSTATE of the database error wrapped by `e`, if any.
pub(crate) fn sqlstate(e: &sqlx::Error) -> Option<String> {
    match e {
        sqlx::Error::Database(db) => db.code().map(|c| c.into_owned()),
        _ => None,
    }
}

pub(crate) const DUPLICATE_SCHEMA: &str = "42P06";
pub(crate) const UNIQUE_VIOLATION: &str = "23505";

impl IntoResponse for TenancyError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.code(), "{self}");
        }
        // Database internals stay in the logs.
        let message = match &self {
            TenancyError::Infrastructure(_) => "Database error".to_string(),
            other => other.to_string(),
        };
        (status, Json(json!({ "error": message, "code": self.code() }))).into_response()
    }
}
