use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use tracing::{info, warn};

use crate::db::execute_script;
use crate::db::schema_manager::{quote_ident, tenant_role_name, validate_schema_name};
use crate::error::{TenancyError, TenancyResult};
use crate::models::provision::AcademicLevel;

/// Per-tenant ledger of applied scripts, created inside each tenant schema.
pub const HISTORY_TABLE: &str = "tenant_schema_history";

const COMMON_DIR: &str = "common";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationScript {
    pub version: i64,
    pub description: String,
    pub checksum: String,
    pub sql: String,
}

impl MigrationScript {
    pub fn new(version: i64, description: &str, sql: &str) -> Self {
        Self {
            version,
            description: description.to_string(),
            checksum: checksum(sql),
            sql: sql.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationReport {
    pub schema: String,
    pub applied_versions: Vec<i64>,
    /// True when drifted checksums were realigned before applying.
    pub repaired: bool,
}

/// Applies the versioned tenant scripts of an academic level to a schema.
#[async_trait]
pub trait MigrationRunner: Send + Sync {
    async fn migrate(&self, schema: &str, level: AcademicLevel) -> TenancyResult<MigrationReport>;

    /// Non-mutating: true when every script is applied with a matching checksum.
    async fn is_schema_up_to_date(&self, schema: &str, level: AcademicLevel)
        -> TenancyResult<bool>;
}

pub fn checksum(sql: &str) -> String {
    hex::encode(Sha256::digest(sql.as_bytes()))
}

/// Parses `V<version>__<description>.sql`.
pub fn parse_file_name(name: &str) -> Option<(i64, String)> {
    let stem = name.strip_suffix(".sql")?;
    let rest = stem.strip_prefix('V').or_else(|| stem.strip_prefix('v'))?;
    let (version, description) = rest.split_once("__")?;
    let version: i64 = version.parse().ok()?;
    Some((version, description.replace('_', " ")))
}

/// Ordered script directories for a level: common scripts first, then the
/// level-specific set.
#[derive(Debug, Clone)]
pub struct MigrationLocations {
    root: PathBuf,
}

impl MigrationLocations {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn for_level(&self, level: AcademicLevel) -> Vec<PathBuf> {
        vec![self.root.join(COMMON_DIR), self.root.join(level.dir_name())]
    }

    /// Loads the union of all locations sorted by version. The same version
    /// appearing twice is an error.
    pub async fn load(&self, level: AcademicLevel) -> Result<Vec<MigrationScript>, String> {
        let mut by_version: HashMap<i64, (PathBuf, MigrationScript)> = HashMap::new();

        for dir in self.for_level(level) {
            for (path, script) in read_scripts(&dir).await? {
                if let Some((existing, _)) = by_version.get(&script.version) {
                    return Err(format!(
                        "duplicate migration version {} in {} and {}",
                        script.version,
                        existing.display(),
                        path.display()
                    ));
                }
                by_version.insert(script.version, (path, script));
            }
        }

        let mut scripts: Vec<MigrationScript> =
            by_version.into_values().map(|(_, s)| s).collect();
        scripts.sort_by_key(|s| s.version);
        Ok(scripts)
    }
}

async fn read_scripts(dir: &Path) -> Result<Vec<(PathBuf, MigrationScript)>, String> {
    // A level without specific scripts simply has no directory.
    if tokio::fs::metadata(dir).await.is_err() {
        return Ok(Vec::new());
    }

    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| format!("cannot read {}: {e}", dir.display()))?;
    let mut scripts = Vec::new();

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| format!("cannot read {}: {e}", dir.display()))?
    {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some((version, description)) = parse_file_name(name) else {
            tracing::debug!("Skipping non-migration file {}", path.display());
            continue;
        };
        let sql = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
        scripts.push((path, MigrationScript::new(version, &description, &sql)));
    }
    Ok(scripts)
}

/// Versions whose recorded checksum no longer matches the script on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumDrift(pub Vec<i64>);

/// Scripts still to apply, in version order. Any script missing from the
/// ledger is pending, even below the highest applied version. Ledger rows
/// without a script are ignored.
pub fn plan<'a>(
    applied: &HashMap<i64, String>,
    scripts: &'a [MigrationScript],
) -> Result<Vec<&'a MigrationScript>, ChecksumDrift> {
    let mut drifted = Vec::new();
    let mut pending = Vec::new();

    for script in scripts {
        match applied.get(&script.version) {
            Some(recorded) if *recorded != script.checksum => drifted.push(script.version),
            Some(_) => {}
            None => pending.push(script),
        }
    }

    if drifted.is_empty() {
        pending.sort_by_key(|s| s.version);
        Ok(pending)
    } else {
        Err(ChecksumDrift(drifted))
    }
}

#[derive(Debug, thiserror::Error)]
enum ApplyError {
    #[error("checksum mismatch on versions {0:?}")]
    Drift(Vec<i64>),
    #[error("script V{version} failed: {source}")]
    Script { version: i64, source: sqlx::Error },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub struct PgMigrationRunner {
    pool: PgPool,
    locations: MigrationLocations,
    default_schema: String,
    installed_by: String,
}

impl PgMigrationRunner {
    pub fn new(pool: PgPool, locations: MigrationLocations, default_schema: &str) -> Self {
        Self {
            pool,
            locations,
            default_schema: default_schema.to_string(),
            installed_by: "scolaris-api".to_string(),
        }
    }

    fn history(schema: &str) -> String {
        format!("{}.{HISTORY_TABLE}", quote_ident(schema))
    }

    async fn load(&self, schema: &str, level: AcademicLevel) -> TenancyResult<Vec<MigrationScript>> {
        self.locations
            .load(level)
            .await
            .map_err(|message| TenancyError::MigrationFailed {
                schema: schema.to_string(),
                message,
            })
    }

    async fn ensure_history_table(&self, schema: &str) -> Result<(), sqlx::Error> {
        let role = tenant_role_name(schema);
        let history = Self::history(schema);
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {history} (
                version      BIGINT PRIMARY KEY,
                description  TEXT NOT NULL,
                checksum     VARCHAR(64) NOT NULL,
                installed_by VARCHAR(255) NOT NULL,
                installed_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            DO $$ BEGIN
              IF EXISTS (SELECT 1 FROM pg_roles WHERE rolname = '{role}') THEN
                EXECUTE 'REVOKE INSERT, UPDATE, DELETE, TRUNCATE ON {history} FROM \"{role}\"';
              END IF;
            END $$"
        );
        let mut conn = self.pool.acquire().await?;
        execute_script(&mut conn, &ddl).await
    }

    async fn history_exists(&self, schema: &str) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
            .bind(format!("{}.{HISTORY_TABLE}", quote_ident(schema)))
            .fetch_one(&self.pool)
            .await
    }

    async fn applied(&self, schema: &str) -> Result<HashMap<i64, String>, sqlx::Error> {
        let select = format!("SELECT version, checksum FROM {}", Self::history(schema));
        let rows: Vec<(i64, String)> = sqlx::query_as(&select).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().collect())
    }

    async fn apply_pending(
        &self,
        schema: &str,
        scripts: &[MigrationScript],
    ) -> Result<Vec<i64>, ApplyError> {
        self.ensure_history_table(schema).await?;
        let applied = self.applied(schema).await?;
        let pending = plan(&applied, scripts).map_err(|d| ApplyError::Drift(d.0))?;
        let search_path = format!("{}, {}", quote_ident(schema), quote_ident(&self.default_schema));
        let record = format!(
            "INSERT INTO {} (version, description, checksum, installed_by)
             VALUES ($1, $2, $3, $4)",
            Self::history(schema)
        );

        let mut versions = Vec::with_capacity(pending.len());
        for script in pending {
            let mut tx = self.pool.begin().await?;
            sqlx::query("SELECT set_config('search_path', $1, true)")
                .bind(&search_path)
                .execute(&mut *tx)
                .await?;
            execute_script(&mut tx, &script.sql)
                .await
                .map_err(|source| ApplyError::Script {
                    version: script.version,
                    source,
                })?;
            sqlx::query(&record)
                .bind(script.version)
                .bind(&script.description)
                .bind(&script.checksum)
                .bind(&self.installed_by)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;

            info!("Applied V{} ({}) to {schema}", script.version, script.description);
            versions.push(script.version);
        }
        Ok(versions)
    }

    /// Realigns recorded checksums with the scripts on disk.
    async fn repair(&self, schema: &str, scripts: &[MigrationScript]) -> Result<usize, sqlx::Error> {
        let applied = self.applied(schema).await?;
        let realign = format!(
            "UPDATE {} SET checksum = $2, description = $3 WHERE version = $1",
            Self::history(schema)
        );
        let mut tx = self.pool.begin().await?;
        let mut repaired = 0;
        for script in scripts {
            if matches!(applied.get(&script.version), Some(recorded) if *recorded != script.checksum) {
                sqlx::query(&realign)
                    .bind(script.version)
                    .bind(&script.checksum)
                    .bind(&script.description)
                    .execute(&mut *tx)
                    .await?;
                repaired += 1;
            }
        }
        tx.commit().await?;
        Ok(repaired)
    }
}

#[async_trait]
impl MigrationRunner for PgMigrationRunner {
    async fn migrate(&self, schema: &str, level: AcademicLevel) -> TenancyResult<MigrationReport> {
        validate_schema_name(schema)?;
        let scripts = self.load(schema, level).await?;
        let failed = |e: &dyn std::fmt::Display| TenancyError::MigrationFailed {
            schema: schema.to_string(),
            message: e.to_string(),
        };

        match self.apply_pending(schema, &scripts).await {
            Ok(applied_versions) => Ok(MigrationReport {
                schema: schema.to_string(),
                applied_versions,
                repaired: false,
            }),
            Err(ApplyError::Drift(versions)) => {
                warn!("Checksum drift in {schema} on {versions:?}, repairing once");
                let repaired = self.repair(schema, &scripts).await.map_err(|e| failed(&e))?;
                info!("Repaired {repaired} history row(s) in {schema}");
                let applied_versions = self
                    .apply_pending(schema, &scripts)
                    .await
                    .map_err(|e| failed(&e))?;
                Ok(MigrationReport {
                    schema: schema.to_string(),
                    applied_versions,
                    repaired: true,
                })
            }
            Err(e) => Err(failed(&e)),
        }
    }

    async fn is_schema_up_to_date(
        &self,
        schema: &str,
        level: AcademicLevel,
    ) -> TenancyResult<bool> {
        validate_schema_name(schema)?;
        if !self.history_exists(schema).await? {
            return Ok(false);
        }
        let scripts = self.load(schema, level).await?;
        let applied = self.applied(schema).await?;
        Ok(matches!(plan(&applied, &scripts), Ok(pending) if pending.is_empty()))
    }
}
