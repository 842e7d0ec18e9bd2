use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use uuid::Uuid;

use crate::config::{is_system_schema, Config};
use crate::db::execute_script;
use crate::error::{sqlstate, TenancyError, TenancyResult, DUPLICATE_SCHEMA};

/// Longest accepted tenant schema name; leaves room for the `_role` suffix
/// inside PostgreSQL's 63-byte identifier limit.
pub const MAX_SCHEMA_NAME_LEN: usize = 48;

const SUFFIX_LEN: usize = 12;

/// Executes schema-level DDL. Holds no business state and never retries.
#[async_trait]
pub trait SchemaManager: Send + Sync {
    async fn schema_exists(&self, name: &str) -> TenancyResult<bool>;

    /// Every schema in the database except system and reserved ones.
    async fn list_schemas(&self) -> TenancyResult<Vec<String>>;

    /// Creates the schema and its least-privilege tenant role. Fails with
    /// `SchemaAlreadyExists` instead of replacing an existing schema.
    async fn create_schema(&self, name: &str) -> TenancyResult<()>;

    async fn drop_schema(&self, name: &str) -> TenancyResult<()>;

    /// Returns whether a schema was actually dropped.
    async fn drop_schema_if_exists(&self, name: &str) -> TenancyResult<bool>;

    async fn assign_to_school(&self, schema: &str, owner_id: Uuid) -> TenancyResult<()>;

    async fn unassign_from_school(&self, schema: &str) -> TenancyResult<()>;
}

/// Returns the PostgreSQL role dedicated to a tenant schema.
pub fn tenant_role_name(schema: &str) -> String {
    format!("{schema}_role")
}

/// Builds a fresh schema name from an operator-supplied prefix:
/// `<sanitized prefix>_<12 hex chars>`.
pub fn schema_name_for_prefix(prefix: &str) -> TenancyResult<String> {
    let sanitized: String = prefix
        .trim()
        .chars()
        .map(|c| if c == '-' || c == ' ' { '_' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect::<String>()
        .to_lowercase();

    if !sanitized.chars().any(|c| c.is_ascii_alphanumeric()) {
        return Err(TenancyError::InvalidSchemaName(prefix.to_string()));
    }
    // Names may not start with a digit or claim a system prefix.
    let sanitized = if sanitized.starts_with(|c: char| c.is_ascii_digit()) || is_system_schema(&sanitized) {
        format!("s_{sanitized}")
    } else {
        sanitized
    };

    let max_prefix = MAX_SCHEMA_NAME_LEN - SUFFIX_LEN - 1;
    let prefix: String = sanitized.chars().take(max_prefix).collect();
    let suffix = Uuid::new_v4().simple().to_string();
    let name = format!("{prefix}_{}", &suffix[..SUFFIX_LEN]);
    validate_schema_name(&name)?;
    Ok(name)
}

/// Only `[a-z_][a-z0-9_]*` names are accepted: they are interpolated into DDL.
pub fn validate_schema_name(name: &str) -> TenancyResult<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_lowercase() || c == '_')
        .unwrap_or(false);
    let valid = valid_start
        && name.len() <= MAX_SCHEMA_NAME_LEN
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !is_system_schema(name);

    if valid {
        Ok(())
    } else {
        Err(TenancyError::InvalidSchemaName(name.to_string()))
    }
}

/// Quote an SQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Role password bound to an owner: stable for the same owner and secret,
/// unusable for any other owner.
pub fn owner_role_password(secret: &str, owner_id: Uuid) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(b":");
    hasher.update(owner_id.as_bytes());
    hex::encode(hasher.finalize())
}

pub struct PgSchemaManager {
    pool: PgPool,
    default_schema: String,
    reserved_schemas: Vec<String>,
    role_secret: String,
    role_default_password: String,
}

impl PgSchemaManager {
    pub fn new(pool: PgPool, config: &Config) -> Self {
        Self {
            pool,
            default_schema: config.default_schema.clone(),
            reserved_schemas: config.reserved_schemas.clone(),
            role_secret: config.tenant_role_secret.clone(),
            role_default_password: config.tenant_role_default_password.clone(),
        }
    }

    fn is_reserved(&self, name: &str) -> bool {
        name == self.default_schema
            || is_system_schema(name)
            || self.reserved_schemas.iter().any(|s| s == name)
    }

    fn ensure_droppable(&self, name: &str) -> TenancyResult<()> {
        if self.is_reserved(name) {
            return Err(TenancyError::ProtectedResource(format!(
                "schema {name} is reserved and cannot be dropped"
            )));
        }
        validate_schema_name(name)
    }

    /// Privileges of a tenant role: full CRUD on its own schema, read-only on
    /// the default schema. Both halves cover future objects.
    fn grant_sql(&self, schema: &str, role: &str) -> String {
        let s = quote_ident(schema);
        let r = quote_ident(role);
        let d = quote_ident(&self.default_schema);
        format!(
            "REVOKE ALL ON SCHEMA {s} FROM PUBLIC;
             GRANT USAGE ON SCHEMA {s} TO {r};
             GRANT SELECT, INSERT, UPDATE, DELETE ON ALL TABLES IN SCHEMA {s} TO {r};
             GRANT USAGE, SELECT, UPDATE ON ALL SEQUENCES IN SCHEMA {s} TO {r};
             GRANT EXECUTE ON ALL FUNCTIONS IN SCHEMA {s} TO {r};
             ALTER DEFAULT PRIVILEGES IN SCHEMA {s} GRANT SELECT, INSERT, UPDATE, DELETE ON TABLES TO {r};
             ALTER DEFAULT PRIVILEGES IN SCHEMA {s} GRANT USAGE, SELECT, UPDATE ON SEQUENCES TO {r};
             ALTER DEFAULT PRIVILEGES IN SCHEMA {s} GRANT EXECUTE ON FUNCTIONS TO {r};
             GRANT USAGE ON SCHEMA {d} TO {r};
             GRANT SELECT ON ALL TABLES IN SCHEMA {d} TO {r};
             REVOKE INSERT, UPDATE, DELETE, TRUNCATE, REFERENCES, TRIGGER ON ALL TABLES IN SCHEMA {d} FROM {r};
             REVOKE CREATE ON SCHEMA {d} FROM {r};
             ALTER DEFAULT PRIVILEGES IN SCHEMA {d} GRANT SELECT ON TABLES TO {r};
             ALTER DEFAULT PRIVILEGES IN SCHEMA {d} REVOKE INSERT, UPDATE, DELETE, TRUNCATE ON TABLES FROM {r}"
        )
    }

    async fn drop_schema_and_role(&self, name: &str) -> TenancyResult<()> {
        let role = tenant_role_name(name);
        let mut tx = self.pool.begin().await?;

        // Privileges must go before the role can be dropped.
        let drop_owned = format!(
            "DO $$ BEGIN
               IF EXISTS (SELECT 1 FROM pg_roles WHERE rolname = '{role}') THEN
                 EXECUTE 'DROP OWNED BY \"{role}\"';
               END IF;
             END $$"
        );
        execute_script(&mut tx, &drop_owned)
            .await
            .map_err(|e| TenancyError::tenant_role(&role, e))?;

        let drop_schema = format!("DROP SCHEMA IF EXISTS {} CASCADE", quote_ident(name));
        execute_script(&mut tx, &drop_schema).await?;

        let drop_role = format!("DROP ROLE IF EXISTS {}", quote_ident(&role));
        execute_script(&mut tx, &drop_role)
            .await
            .map_err(|e| TenancyError::tenant_role(&role, e))?;

        tx.commit().await?;
        tracing::info!("Dropped tenant schema {name} and role {role}");
        Ok(())
    }
}

/// Creates the role only when missing; roles can outlive a failed attempt.
fn ensure_role_sql(role: &str) -> String {
    format!(
        "DO $$ BEGIN
           IF NOT EXISTS (SELECT 1 FROM pg_roles WHERE rolname = '{role}') THEN
             CREATE ROLE \"{role}\" NOLOGIN;
           END IF;
         END $$"
    )
}

#[async_trait]
impl SchemaManager for PgSchemaManager {
    async fn schema_exists(&self, name: &str) -> TenancyResult<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_namespace WHERE nspname = $1)")
                .bind(name)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn list_schemas(&self) -> TenancyResult<Vec<String>> {
        let names: Vec<String> =
            sqlx::query_scalar("SELECT nspname::TEXT FROM pg_namespace ORDER BY nspname")
                .fetch_all(&self.pool)
                .await?;
        Ok(names.into_iter().filter(|n| !self.is_reserved(n)).collect())
    }

    async fn create_schema(&self, name: &str) -> TenancyResult<()> {
        if name == self.default_schema {
            return Ok(());
        }
        validate_schema_name(name)?;
        if self.is_reserved(name) {
            return Err(TenancyError::ProtectedResource(format!(
                "schema {name} is reserved"
            )));
        }

        let role = tenant_role_name(name);
        let mut tx = self.pool.begin().await?;

        // Owned by the administrative role, never by the tenant role.
        let create = format!("CREATE SCHEMA {} AUTHORIZATION CURRENT_USER", quote_ident(name));
        execute_script(&mut tx, &create)
            .await
            .map_err(|e| match sqlstate(&e).as_deref() {
            Some(DUPLICATE_SCHEMA) => TenancyError::SchemaAlreadyExists(name.to_string()),
            _ => TenancyError::Infrastructure(e),
        })?;

        let ensure_role = ensure_role_sql(&role);
        execute_script(&mut tx, &ensure_role)
            .await
            .map_err(|e| TenancyError::tenant_role(&role, e))?;

        let grants = self.grant_sql(name, &role);
        execute_script(&mut tx, &grants).await?;

        tx.commit().await?;
        tracing::info!("Created tenant schema {name} with role {role}");
        Ok(())
    }

    async fn drop_schema(&self, name: &str) -> TenancyResult<()> {
        self.ensure_droppable(name)?;
        if !self.schema_exists(name).await? {
            return Err(TenancyError::SchemaNotFound(name.to_string()));
        }
        self.drop_schema_and_role(name).await
    }

    async fn drop_schema_if_exists(&self, name: &str) -> TenancyResult<bool> {
        self.ensure_droppable(name)?;
        let existed = self.schema_exists(name).await?;
        // Runs even when the schema is gone: a role may linger from a partial failure.
        self.drop_schema_and_role(name).await?;
        Ok(existed)
    }

    async fn assign_to_school(&self, schema: &str, owner_id: Uuid) -> TenancyResult<()> {
        validate_schema_name(schema)?;
        if !self.schema_exists(schema).await? {
            return Err(TenancyError::SchemaNotFound(schema.to_string()));
        }

        let role = tenant_role_name(schema);
        let password = owner_role_password(&self.role_secret, owner_id);
        let mut tx = self.pool.begin().await?;

        let ensure_role = ensure_role_sql(&role);
        execute_script(&mut tx, &ensure_role)
            .await
            .map_err(|e| TenancyError::tenant_role(&role, e))?;

        let rotate = format!(
            "ALTER ROLE {} WITH LOGIN PASSWORD {}",
            quote_ident(&role),
            quote_literal(&password)
        );
        execute_script(&mut tx, &rotate)
            .await
            .map_err(|e| TenancyError::tenant_role(&role, e))?;

        tx.commit()
            .await
            .map_err(|e| TenancyError::tenant_role(&role, e))?;
        tracing::info!("Rotated credentials of {role} for owner {owner_id}");
        Ok(())
    }

    async fn unassign_from_school(&self, schema: &str) -> TenancyResult<()> {
        validate_schema_name(schema)?;
        let role = tenant_role_name(schema);
        let mut tx = self.pool.begin().await?;

        let ensure_role = ensure_role_sql(&role);
        execute_script(&mut tx, &ensure_role)
            .await
            .map_err(|e| TenancyError::tenant_role(&role, e))?;

        let reset = format!(
            "ALTER ROLE {} WITH NOLOGIN PASSWORD {}",
            quote_ident(&role),
            quote_literal(&self.role_default_password)
        );
        execute_script(&mut tx, &reset)
            .await
            .map_err(|e| TenancyError::tenant_role(&role, e))?;

        tx.commit()
            .await
            .map_err(|e| TenancyError::tenant_role(&role, e))?;
        tracing::info!("Reset credentials of {role}");
        Ok(())
    }
}
