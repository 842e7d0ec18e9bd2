//! In-memory stand-ins for the database-backed seams, with fault injection.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::Config;
use crate::db::migrations::{MigrationReport, MigrationRunner};
use crate::db::provisions::ProvisionStore;
use crate::db::schema_manager::SchemaManager;
use crate::error::{TenancyError, TenancyResult};
use crate::models::provision::{
    AcademicLevel, NewProvision, ProvisionFilter, ProvisionRecord, ProvisionStats,
    ProvisionStatus,
};
use crate::services::access::OwnerActivityChecker;
use crate::services::cache::MemoryCache;
use crate::services::orchestrator::ProvisioningOrchestrator;
use crate::services::tenant_cache::{CacheSettings, TenantCache};

pub fn test_config() -> Config {
    Config {
        database_url: "postgres://localhost/scolaris_test".into(),
        db_max_connections: 2,
        redis_url: None,
        host: "127.0.0.1".into(),
        port: 0,
        super_admin_key: "test-admin-key".into(),
        default_schema: "public".into(),
        reserved_schemas: vec!["public".into(), "tenancy".into()],
        tenant_migrations_dir: "./tenant_migrations".into(),
        schema_cache_ttl_secs: 3600,
        access_cache_ttl_secs: 600,
        access_check_timeout_ms: 5000,
        tenant_role_secret: "secret".into(),
        tenant_role_default_password: "unassigned".into(),
        failed_provision_max_age_days: 7,
        sweep_interval_secs: 3600,
    }
}

// ─── Schema manager ──────────────────────────────────────────────────────────

#[derive(Default)]
struct SchemaState {
    schemas: HashSet<String>,
    owners: HashMap<String, Uuid>,
    creates: HashMap<String, usize>,
    drops: HashMap<String, usize>,
}

type Hook = Box<dyn FnOnce() + Send>;

pub struct MemorySchemaManager {
    state: Mutex<SchemaState>,
    reserved: Vec<String>,
    before_exists: Mutex<Option<Hook>>,
}

impl MemorySchemaManager {
    pub fn new(reserved: &[String]) -> Self {
        let mut state = SchemaState::default();
        state.schemas.extend(reserved.iter().cloned());
        Self {
            state: Mutex::new(state),
            reserved: reserved.to_vec(),
            before_exists: Mutex::new(None),
        }
    }

    /// Runs `hook` just before the next `schema_exists` reads the state.
    pub fn before_next_exists(&self, hook: impl FnOnce() + Send + 'static) {
        *self.before_exists.lock().unwrap() = Some(Box::new(hook));
    }

    /// A schema created behind the control plane's back.
    pub fn insert_raw(&self, name: &str) {
        self.state.lock().unwrap().schemas.insert(name.to_string());
    }

    /// A schema dropped behind the control plane's back, role included.
    pub fn remove_raw(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.schemas.remove(name);
        state.owners.remove(name);
    }

    pub fn owner_of(&self, schema: &str) -> Option<Uuid> {
        self.state.lock().unwrap().owners.get(schema).copied()
    }

    pub fn create_count(&self, schema: &str) -> usize {
        *self.state.lock().unwrap().creates.get(schema).unwrap_or(&0)
    }

    pub fn drop_count(&self, schema: &str) -> usize {
        *self.state.lock().unwrap().drops.get(schema).unwrap_or(&0)
    }

    fn exists(&self, name: &str) -> bool {
        self.state.lock().unwrap().schemas.contains(name)
    }

    fn drop_now(&self, name: &str) -> TenancyResult<bool> {
        if self.reserved.iter().any(|r| r == name) {
            return Err(TenancyError::ProtectedResource(name.to_string()));
        }
        let mut state = self.state.lock().unwrap();
        let existed = state.schemas.remove(name);
        state.owners.remove(name);
        if existed {
            *state.drops.entry(name.to_string()).or_default() += 1;
        }
        Ok(existed)
    }
}

#[async_trait]
impl SchemaManager for MemorySchemaManager {
    async fn schema_exists(&self, name: &str) -> TenancyResult<bool> {
        tokio::task::yield_now().await;
        let hook = self.before_exists.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        Ok(self.exists(name))
    }

    async fn list_schemas(&self) -> TenancyResult<Vec<String>> {
        let state = self.state.lock().unwrap();
        let mut names: Vec<String> = state
            .schemas
            .iter()
            .filter(|s| !self.reserved.contains(*s))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    async fn create_schema(&self, name: &str) -> TenancyResult<()> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock().unwrap();
        if !state.schemas.insert(name.to_string()) {
            return Err(TenancyError::SchemaAlreadyExists(name.to_string()));
        }
        *state.creates.entry(name.to_string()).or_default() += 1;
        Ok(())
    }

    async fn drop_schema(&self, name: &str) -> TenancyResult<()> {
        if self.drop_now(name)? {
            Ok(())
        } else {
            Err(TenancyError::SchemaNotFound(name.to_string()))
        }
    }

    async fn drop_schema_if_exists(&self, name: &str) -> TenancyResult<bool> {
        self.drop_now(name)
    }

    async fn assign_to_school(&self, schema: &str, owner_id: Uuid) -> TenancyResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.schemas.contains(schema) {
            return Err(TenancyError::SchemaNotFound(schema.to_string()));
        }
        state.owners.insert(schema.to_string(), owner_id);
        Ok(())
    }

    async fn unassign_from_school(&self, schema: &str) -> TenancyResult<()> {
        self.state.lock().unwrap().owners.remove(schema);
        Ok(())
    }
}

// ─── Migration runner ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub enum Fault {
    Error,
    Panic,
}

pub struct MemoryMigrationRunner {
    schemas: Arc<MemorySchemaManager>,
    applied: Mutex<HashSet<String>>,
    faults: Mutex<Vec<Fault>>,
}

impl MemoryMigrationRunner {
    pub fn new(schemas: Arc<MemorySchemaManager>) -> Self {
        Self {
            schemas,
            applied: Mutex::new(HashSet::new()),
            faults: Mutex::new(Vec::new()),
        }
    }

    /// Makes the next `migrate` call fail with `fault`. Faults queue up.
    pub fn inject(&self, fault: Fault) {
        self.faults.lock().unwrap().push(fault);
    }

    pub fn is_applied(&self, schema: &str) -> bool {
        self.applied.lock().unwrap().contains(schema)
    }
}

#[async_trait]
impl MigrationRunner for MemoryMigrationRunner {
    async fn migrate(&self, schema: &str, _level: AcademicLevel) -> TenancyResult<MigrationReport> {
        let fault = {
            let mut faults = self.faults.lock().unwrap();
            (!faults.is_empty()).then(|| faults.remove(0))
        };
        match fault {
            Some(Fault::Error) => {
                return Err(TenancyError::MigrationFailed {
                    schema: schema.to_string(),
                    message: "injected failure".into(),
                })
            }
            Some(Fault::Panic) => panic!("injected panic while migrating {schema}"),
            None => {}
        }
        if !self.schemas.exists(schema) {
            return Err(TenancyError::SchemaNotFound(schema.to_string()));
        }
        self.applied.lock().unwrap().insert(schema.to_string());
        Ok(MigrationReport {
            schema: schema.to_string(),
            applied_versions: vec![1, 2, 100],
            repaired: false,
        })
    }

    async fn is_schema_up_to_date(
        &self,
        schema: &str,
        _level: AcademicLevel,
    ) -> TenancyResult<bool> {
        Ok(self.schemas.exists(schema) && self.is_applied(schema))
    }
}

// ─── Provision store ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryProvisionStore {
    rows: Mutex<Vec<ProvisionRecord>>,
}

impl MemoryProvisionStore {
    /// Moves a record's `updated_at` into the past.
    pub fn backdate(&self, id: Uuid, by: chrono::Duration) {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.iter_mut().find(|r| r.id == id) {
            row.updated_at -= by;
        }
    }

    /// Synchronous `insert_pending`, for use inside hooks.
    pub fn insert_now(&self, new: NewProvision) -> TenancyResult<ProvisionRecord> {
        let mut rows = self.rows.lock().unwrap();
        if rows.iter().any(|r| r.schema_name == new.schema_name) {
            return Err(TenancyError::ProvisionConflict(new.schema_name));
        }
        let now = Utc::now();
        let record = ProvisionRecord {
            id: Uuid::new_v4(),
            schema_name: new.schema_name,
            status: ProvisionStatus::Pending,
            academic_level: new.academic_level,
            assigned_owner_id: None,
            assigned_by: None,
            assigned_at: None,
            accessible: false,
            error_message: None,
            attempts: 0,
            requested_by: new.requested_by,
            created_at: now,
            updated_at: now,
        };
        rows.push(record.clone());
        Ok(record)
    }

    fn update<F>(&self, id: Uuid, guard: impl Fn(&ProvisionRecord) -> bool, f: F) -> Option<ProvisionRecord>
    where
        F: FnOnce(&mut ProvisionRecord),
    {
        let mut rows = self.rows.lock().unwrap();
        let row = rows.iter_mut().find(|r| r.id == id && guard(r))?;
        f(row);
        row.updated_at = Utc::now();
        Some(row.clone())
    }

    fn require(&self, id: Uuid, f: impl FnOnce(&mut ProvisionRecord)) -> TenancyResult<ProvisionRecord> {
        self.update(id, |_| true, f)
            .ok_or_else(|| TenancyError::ProvisionNotFound(id.to_string()))
    }
}

#[async_trait]
impl ProvisionStore for MemoryProvisionStore {
    async fn insert_pending(&self, new: NewProvision) -> TenancyResult<ProvisionRecord> {
        self.insert_now(new)
    }

    async fn find_by_id(&self, id: Uuid) -> TenancyResult<Option<ProvisionRecord>> {
        Ok(self.rows.lock().unwrap().iter().find(|r| r.id == id).cloned())
    }

    async fn find_by_schema(&self, schema: &str) -> TenancyResult<Option<ProvisionRecord>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.schema_name == schema)
            .cloned())
    }

    async fn find_by_owner(&self, owner_id: Uuid) -> TenancyResult<Option<ProvisionRecord>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.assigned_owner_id == Some(owner_id))
            .cloned())
    }

    async fn list(&self, filter: &ProvisionFilter) -> TenancyResult<Vec<ProvisionRecord>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| filter.status.map_or(true, |s| r.status == s))
            .filter(|r| filter.owner_id.map_or(true, |o| r.assigned_owner_id == Some(o)))
            .cloned()
            .collect())
    }

    async fn mark_provisioned(&self, id: Uuid) -> TenancyResult<ProvisionRecord> {
        self.require(id, |r| {
            r.status = ProvisionStatus::Provisioned;
            r.error_message = None;
        })
    }

    async fn mark_failed(&self, id: Uuid, message: &str) -> TenancyResult<ProvisionRecord> {
        self.require(id, |r| {
            r.status = ProvisionStatus::Failed;
            r.error_message = Some(message.to_string());
            r.attempts += 1;
            r.accessible = false;
        })
    }

    async fn reset_to_pending(&self, id: Uuid) -> TenancyResult<ProvisionRecord> {
        self.require(id, |r| {
            r.status = ProvisionStatus::Pending;
            r.accessible = false;
        })
    }

    async fn assign(
        &self,
        id: Uuid,
        owner_id: Uuid,
        assigned_by: &str,
    ) -> TenancyResult<Option<ProvisionRecord>> {
        if self.find_by_owner(owner_id).await?.is_some() {
            return Err(TenancyError::ProvisionConflict(owner_id.to_string()));
        }
        Ok(self.update(
            id,
            |r| r.is_provisioned() && !r.is_assigned(),
            |r| {
                r.assigned_owner_id = Some(owner_id);
                r.assigned_by = Some(assigned_by.to_string());
                r.assigned_at = Some(Utc::now());
                r.accessible = true;
            },
        ))
    }

    async fn unassign(&self, id: Uuid) -> TenancyResult<Option<ProvisionRecord>> {
        Ok(self.update(id, |r| r.is_assigned(), |r| {
            r.assigned_owner_id = None;
            r.assigned_by = None;
            r.assigned_at = None;
            r.accessible = false;
        }))
    }

    async fn set_accessible(
        &self,
        id: Uuid,
        accessible: bool,
    ) -> TenancyResult<Option<ProvisionRecord>> {
        Ok(self.update(
            id,
            |r| !accessible || (r.is_provisioned() && r.is_assigned()),
            |r| r.accessible = accessible,
        ))
    }

    async fn delete(&self, id: Uuid) -> TenancyResult<bool> {
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|r| r.id != id);
        Ok(rows.len() < before)
    }

    async fn find_failed_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> TenancyResult<Vec<ProvisionRecord>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.status == ProvisionStatus::Failed && r.updated_at < cutoff)
            .cloned()
            .collect())
    }

    async fn stats(&self) -> TenancyResult<ProvisionStats> {
        let rows = self.rows.lock().unwrap();
        let count = |s: ProvisionStatus| rows.iter().filter(|r| r.status == s).count() as i64;
        Ok(ProvisionStats::from_counts(
            count(ProvisionStatus::Provisioned),
            count(ProvisionStatus::Pending),
            count(ProvisionStatus::Failed),
        ))
    }
}

// ─── Activity checker ────────────────────────────────────────────────────────

#[derive(Default)]
pub struct StaticActivityChecker {
    active: Mutex<HashMap<Uuid, bool>>,
    delay: Mutex<Duration>,
    failing: AtomicBool,
}

impl StaticActivityChecker {
    pub fn set_active(&self, owner_id: Uuid, active: bool) {
        self.active.lock().unwrap().insert(owner_id, active);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl OwnerActivityChecker for StaticActivityChecker {
    async fn is_owner_active(&self, owner_id: Uuid) -> TenancyResult<bool> {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(TenancyError::Infrastructure(sqlx::Error::PoolTimedOut));
        }
        Ok(*self.active.lock().unwrap().get(&owner_id).unwrap_or(&false))
    }
}

// ─── Harness ─────────────────────────────────────────────────────────────────

/// Orchestrator and cache wired to the in-memory fakes.
pub struct Harness {
    pub config: Config,
    pub schemas: Arc<MemorySchemaManager>,
    pub migrations: Arc<MemoryMigrationRunner>,
    pub store: Arc<MemoryProvisionStore>,
    pub checker: Arc<StaticActivityChecker>,
    pub backend: Arc<MemoryCache>,
    pub cache: Arc<TenantCache>,
    pub orchestrator: Arc<ProvisioningOrchestrator>,
}

impl Harness {
    pub fn new() -> Self {
        let config = test_config();
        let schemas = Arc::new(MemorySchemaManager::new(&config.reserved_schemas));
        let migrations = Arc::new(MemoryMigrationRunner::new(schemas.clone()));
        let store = Arc::new(MemoryProvisionStore::default());
        let checker = Arc::new(StaticActivityChecker::default());
        let backend = Arc::new(MemoryCache::new());
        let cache = Arc::new(TenantCache::new(
            backend.clone(),
            store.clone(),
            checker.clone(),
            CacheSettings::from_config(&config),
        ));
        let orchestrator = Arc::new(ProvisioningOrchestrator::new(
            schemas.clone(),
            migrations.clone(),
            store.clone(),
            cache.clone(),
        ));
        Self {
            config,
            schemas,
            migrations,
            store,
            checker,
            backend,
            cache,
            orchestrator,
        }
    }
}
