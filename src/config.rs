use std::env;
use std::time::Duration;

use crate::db::CONTROL_SCHEMA;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub db_max_connections: u32,
    /// Unset means the in-process cache backend (single instance only).
    pub redis_url: Option<String>,
    pub host: String,
    pub port: u16,
    pub super_admin_key: String,
    pub default_schema: String,
    pub reserved_schemas: Vec<String>,
    pub tenant_migrations_dir: String,
    pub schema_cache_ttl_secs: u64,
    pub access_cache_ttl_secs: u64,
    pub access_check_timeout_ms: u64,
    pub tenant_role_secret: String,
    pub tenant_role_default_password: String,
    pub failed_provision_max_age_days: i64,
    pub sweep_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let default_schema = env::var("DEFAULT_SCHEMA").unwrap_or_else(|_| "public".into());
        let reserved_schemas = parse_list(
            &env::var("RESERVED_SCHEMAS")
                .unwrap_or_else(|_| "public,tenancy,information_schema".into()),
        );

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            db_max_connections: env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".into())
                .parse()?,
            redis_url: env::var("REDIS_URL").ok().filter(|s| !s.is_empty()),
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".into())
                .parse()?,
            super_admin_key: env::var("SUPER_ADMIN_KEY")
                .unwrap_or_else(|_| "change_this_super_admin_key".into()),
            reserved_schemas: with_required_reserved(
                reserved_schemas,
                &default_schema,
                CONTROL_SCHEMA,
            ),
            default_schema,
            tenant_migrations_dir: env::var("TENANT_MIGRATIONS_DIR")
                .unwrap_or_else(|_| "./tenant_migrations".into()),
            schema_cache_ttl_secs: env::var("SCHEMA_CACHE_TTL_SECS")
                .unwrap_or_else(|_| "2592000".into())
                .parse()?,
            access_cache_ttl_secs: env::var("ACCESS_CACHE_TTL_SECS")
                .unwrap_or_else(|_| "86400".into())
                .parse()?,
            access_check_timeout_ms: env::var("ACCESS_CHECK_TIMEOUT_MS")
                .unwrap_or_else(|_| "5000".into())
                .parse()?,
            tenant_role_secret: env::var("TENANT_ROLE_SECRET")
                .unwrap_or_else(|_| "change_this_tenant_role_secret".into()),
            tenant_role_default_password: env::var("TENANT_ROLE_DEFAULT_PASSWORD")
                .unwrap_or_else(|_| "unassigned_tenant_role".into()),
            failed_provision_max_age_days: env::var("FAILED_PROVISION_MAX_AGE_DAYS")
                .unwrap_or_else(|_| "7".into())
                .parse()?,
            sweep_interval_secs: env::var("SWEEP_INTERVAL_SECS")
                .unwrap_or_else(|_| "3600".into())
                .parse()?,
        })
    }

    pub fn access_check_timeout(&self) -> Duration {
        Duration::from_millis(self.access_check_timeout_ms)
    }
}

/// Schemas owned by PostgreSQL itself, never managed by the control plane.
pub fn is_system_schema(name: &str) -> bool {
    name.starts_with("pg_") || name == "information_schema"
}

fn required(key: &str) -> anyhow::Result<String> {
    env::var(key).map_err(|_| anyhow::anyhow!("Missing required env var: {}", key))
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

/// The default and control schemas are always reserved, whatever the env says.
fn with_required_reserved(mut list: Vec<String>, default: &str, control: &str) -> Vec<String> {
    for name in [default, control] {
        if !list.iter().any(|s| s == name) {
            list.push(name.to_string());
        }
    }
    list
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_reserved_list_and_keeps_required_entries() {
        let list = with_required_reserved(parse_list(" Audit , ,extensions"), "public", "tenancy");
        assert_eq!(list, vec!["audit", "extensions", "public", "tenancy"]);
    }

    #[test]
    fn system_schemas_are_recognised() {
        assert!(is_system_schema("pg_catalog"));
        assert!(is_system_schema("pg_toast"));
        assert!(is_system_schema("information_schema"));
        assert!(!is_system_schema("school_0a1b2c3d4e5f"));
    }
}
