use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{Duration, Utc};
use futures_util::FutureExt;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::migrations::{MigrationReport, MigrationRunner};
use crate::db::provisions::ProvisionStore;
use crate::db::schema_manager::{schema_name_for_prefix, validate_schema_name, SchemaManager};
use crate::error::{TenancyError, TenancyResult};
use crate::models::provision::{
    AcademicLevel, ConsistencyReport, NewProvision, ProvisionFilter, ProvisionRecord,
    ProvisionStats, ProvisionStatus, RepairAction, SweepReport,
};
use crate::services::metrics::{record_sweep_item, PROVISIONING_COUNTER};
use crate::services::tenant_cache::{OwnerChange, TenantCache};

/// How long a PENDING record counts as an in-flight provisioning.
pub const IN_FLIGHT_GRACE_MINUTES: i64 = 15;

fn is_in_flight(record: &ProvisionRecord) -> bool {
    record.status == ProvisionStatus::Pending
        && record.updated_at > Utc::now() - Duration::minutes(IN_FLIGHT_GRACE_MINUTES)
}

/// Drives tenant schemas through their lifecycle:
/// PENDING → PROVISIONED | FAILED, FAILED → PENDING on retry.
///
/// Every step is recorded in the provisioning store before the next one
/// starts, so a crash at any point leaves a record that either a retry or a
/// sweep can pick up. Cache updates are issued only after the store write
/// they mirror has returned.
pub struct ProvisioningOrchestrator {
    schemas: Arc<dyn SchemaManager>,
    migrations: Arc<dyn MigrationRunner>,
    store: Arc<dyn ProvisionStore>,
    cache: Arc<TenantCache>,
}

impl ProvisioningOrchestrator {
    pub fn new(
        schemas: Arc<dyn SchemaManager>,
        migrations: Arc<dyn MigrationRunner>,
        store: Arc<dyn ProvisionStore>,
        cache: Arc<TenantCache>,
    ) -> Self {
        Self {
            schemas,
            migrations,
            store,
            cache,
        }
    }

    pub fn store(&self) -> &Arc<dyn ProvisionStore> {
        &self.store
    }

    /// Provisions a schema named after `prefix` with a random suffix.
    pub async fn create_provision(
        &self,
        prefix: &str,
        level: AcademicLevel,
        requested_by: &str,
    ) -> TenancyResult<ProvisionRecord> {
        let schema = schema_name_for_prefix(prefix)?;
        self.orchestrate_provisioning(&schema, level, requested_by)
            .await
    }

    /// Creates `schema`, migrates it for `level` and records the outcome.
    ///
    /// Rejected with `SchemaAlreadyExists` when a record for the name exists,
    /// whatever its status; a schema without a record is dropped first. Two
    /// concurrent requests for the same name race on the record insert, and
    /// the loser gets `ProvisionConflict` without touching the database.
    pub async fn orchestrate_provisioning(
        &self,
        schema: &str,
        level: AcademicLevel,
        requested_by: &str,
    ) -> TenancyResult<ProvisionRecord> {
        validate_schema_name(schema)?;

        // Read existence before the record: a concurrent request inserts its
        // record before creating the schema, so an in-flight schema is never
        // seen without its record.
        let in_database = self.schemas.schema_exists(schema).await?;
        if let Some(existing) = self.store.find_by_schema(schema).await? {
            PROVISIONING_COUNTER.with_label_values(&["conflict"]).inc();
            return Err(TenancyError::SchemaAlreadyExists(format!(
                "{schema} is already recorded with status {}",
                existing.status
            )));
        }
        if in_database {
            warn!("Dropping unrecorded schema {schema} before provisioning it");
            self.schemas.drop_schema_if_exists(schema).await?;
        }

        let record = self
            .store
            .insert_pending(NewProvision {
                schema_name: schema.to_string(),
                academic_level: level,
                requested_by: requested_by.to_string(),
            })
            .await
            .inspect_err(|e| {
                if e.is_conflict() {
                    PROVISIONING_COUNTER.with_label_values(&["conflict"]).inc();
                }
            })?;
        info!("Provisioning {schema} ({level}) requested by {requested_by}");

        self.run_provisioning(record).await
    }

    /// Runs the create → migrate → validate steps for a PENDING record and
    /// records PROVISIONED or FAILED. Panics inside the steps are recorded as
    /// failures like any other error.
    async fn run_provisioning(&self, record: ProvisionRecord) -> TenancyResult<ProvisionRecord> {
        let schema = record.schema_name.clone();
        let outcome = AssertUnwindSafe(self.provisioning_steps(&schema, record.academic_level))
            .catch_unwind()
            .await;

        let message = match outcome {
            Ok(Ok(())) => {
                let provisioned = self.store.mark_provisioned(record.id).await?;
                PROVISIONING_COUNTER
                    .with_label_values(&["provisioned"])
                    .inc();
                info!("Provisioned {schema}");
                return Ok(provisioned);
            }
            Ok(Err(e)) => e.to_string(),
            Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
        };

        PROVISIONING_COUNTER.with_label_values(&["failed"]).inc();
        match self.store.mark_failed(record.id, &message).await {
            Ok(failed) => warn!(
                "Provisioning {schema} failed (attempt {}): {message}",
                failed.attempts
            ),
            Err(e) => error!("Provisioning {schema} failed ({message}) and could not be recorded: {e}"),
        }
        Err(TenancyError::ProvisioningFailed { schema, message })
    }

    async fn provisioning_steps(&self, schema: &str, level: AcademicLevel) -> TenancyResult<()> {
        self.schemas.create_schema(schema).await?;
        let report = self.migrations.migrate(schema, level).await?;
        info!(
            "Migrated {schema}: {} script(s) applied",
            report.applied_versions.len()
        );

        if !self.schemas.schema_exists(schema).await? {
            return Err(TenancyError::SchemaNotFound(format!(
                "{schema} vanished after creation"
            )));
        }
        if !self.migrations.is_schema_up_to_date(schema, level).await? {
            return Err(TenancyError::MigrationFailed {
                schema: schema.to_string(),
                message: "scripts still pending after migration".into(),
            });
        }
        Ok(())
    }

    /// Retries a FAILED or PENDING provision, or rebuilds any record whose
    /// schema is gone. An existing schema is dropped and rebuilt from scratch.
    /// A rebuilt assigned record gets fresh credentials and its previous
    /// access state back.
    pub async fn retry_provisioning(&self, id: Uuid) -> TenancyResult<ProvisionRecord> {
        let record = self.require(id).await?;
        let schema = record.schema_name.clone();

        if self.schemas.schema_exists(&schema).await? {
            if record.is_provisioned() {
                return Err(TenancyError::InvalidProvisionState(format!(
                    "{schema} is provisioned and present; nothing to retry"
                )));
            }
            info!("Retry of {schema}: dropping partial schema for a full rebuild");
            self.schemas.drop_schema(&schema).await?;
        } else {
            info!("Retry of {schema}: schema is missing, rebuilding from scratch");
        }

        let was_accessible = record.accessible;
        let pending = self.store.reset_to_pending(id).await?;
        if let Some(owner_id) = pending.assigned_owner_id {
            self.cache
                .apply(OwnerChange::AccessChanged {
                    owner_id,
                    accessible: false,
                })
                .await;
        }

        let provisioned = self.run_provisioning(pending).await?;
        self.restore_assignment(provisioned, was_accessible).await
    }

    async fn restore_assignment(
        &self,
        record: ProvisionRecord,
        reopen: bool,
    ) -> TenancyResult<ProvisionRecord> {
        let Some(owner_id) = record.assigned_owner_id else {
            return Ok(record);
        };
        // The rebuild dropped the tenant role along with the schema.
        self.schemas
            .assign_to_school(&record.schema_name, owner_id)
            .await?;

        if !reopen {
            return Ok(record);
        }
        let reopened = self
            .store
            .set_accessible(record.id, true)
            .await?
            .ok_or_else(|| {
                TenancyError::InvalidProvisionState(format!(
                    "{} changed while it was being rebuilt",
                    record.schema_name
                ))
            })?;
        self.cache
            .apply(OwnerChange::Bound {
                owner_id,
                accessible: true,
            })
            .await;
        info!("Restored access to {} for {owner_id}", reopened.schema_name);
        Ok(reopened)
    }

    /// Applies pending tenant scripts to a PROVISIONED schema.
    pub async fn migrate_schema(&self, id: Uuid) -> TenancyResult<MigrationReport> {
        let record = self.require(id).await?;
        if !record.is_provisioned() {
            return Err(TenancyError::InvalidProvisionState(format!(
                "{} is {}; only provisioned schemas are migrated",
                record.schema_name, record.status
            )));
        }
        self.migrations
            .migrate(&record.schema_name, record.academic_level)
            .await
    }

    pub async fn migrate_all_provisioned(&self) -> TenancyResult<SweepReport> {
        let records = self
            .store
            .list(&ProvisionFilter {
                status: Some(ProvisionStatus::Provisioned),
                owner_id: None,
            })
            .await?;

        let mut report = SweepReport::default();
        for record in records {
            match self
                .migrations
                .migrate(&record.schema_name, record.academic_level)
                .await
            {
                Ok(_) => report.record_success(),
                Err(e) => {
                    warn!("Migration sweep: {} failed: {e}", record.schema_name);
                    report.record_failure(record.schema_name, e);
                }
            }
        }
        log_sweep("migrate_all", &report);
        Ok(report)
    }

    pub async fn is_provision_up_to_date(&self, id: Uuid) -> TenancyResult<bool> {
        let record = self.require(id).await?;
        if !record.is_provisioned() {
            return Ok(false);
        }
        self.migrations
            .is_schema_up_to_date(&record.schema_name, record.academic_level)
            .await
    }

    /// Records whose schema no longer exists.
    pub async fn find_orphaned_provisions(&self) -> TenancyResult<Vec<ProvisionRecord>> {
        let existing: HashSet<String> = self.schemas.list_schemas().await?.into_iter().collect();
        let records = self.store.list(&ProvisionFilter::default()).await?;
        Ok(records
            .into_iter()
            .filter(|r| !existing.contains(&r.schema_name))
            .collect())
    }

    /// Non-reserved schemas without a record.
    pub async fn find_orphaned_schemas(&self) -> TenancyResult<Vec<String>> {
        let recorded: HashSet<String> = self
            .store
            .list(&ProvisionFilter::default())
            .await?
            .into_iter()
            .map(|r| r.schema_name)
            .collect();
        Ok(self
            .schemas
            .list_schemas()
            .await?
            .into_iter()
            .filter(|s| !recorded.contains(s))
            .collect())
    }

    pub async fn cleanup_all_orphaned_schemas(&self) -> TenancyResult<SweepReport> {
        let mut report = SweepReport::default();
        for schema in self.find_orphaned_schemas().await? {
            match self.repair_inconsistent_provision(&schema).await {
                Ok(_) => {
                    record_sweep_item("orphan_schemas", true);
                    report.record_success();
                }
                Err(e) => {
                    warn!("Orphan cleanup: {schema} failed: {e}");
                    record_sweep_item("orphan_schemas", false);
                    report.record_failure(schema, e);
                }
            }
        }
        log_sweep("cleanup_orphaned_schemas", &report);
        Ok(report)
    }

    pub async fn recover_all_orphaned_provisions(&self) -> TenancyResult<SweepReport> {
        let mut report = SweepReport::default();
        for record in self.find_orphaned_provisions().await? {
            match self.repair_inconsistent_provision(&record.schema_name).await {
                Ok(_) => {
                    record_sweep_item("orphan_provisions", true);
                    report.record_success();
                }
                Err(e) => {
                    warn!("Orphan recovery: {} failed: {e}", record.schema_name);
                    record_sweep_item("orphan_provisions", false);
                    report.record_failure(record.schema_name, e);
                }
            }
        }
        log_sweep("recover_orphaned_provisions", &report);
        Ok(report)
    }

    /// Deletes FAILED records older than `max_age_days`, dropping whatever
    /// schema they left behind.
    pub async fn cleanup_failed_provisions(&self, max_age_days: i64) -> TenancyResult<SweepReport> {
        let cutoff = (max_age_days >= 0)
            .then(|| Duration::try_days(max_age_days))
            .flatten()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .ok_or_else(|| {
                TenancyError::InvalidArgument(format!("max_age_days out of range: {max_age_days}"))
            })?;
        let mut report = SweepReport::default();

        for record in self.store.find_failed_before(cutoff).await? {
            if let Err(e) = self.schemas.drop_schema_if_exists(&record.schema_name).await {
                warn!(
                    "Failed-provision cleanup: could not drop {}: {e}",
                    record.schema_name
                );
            }
            match self.store.delete(record.id).await {
                Ok(_) => {
                    if let Some(owner_id) = record.assigned_owner_id {
                        self.cache.apply(OwnerChange::Released { owner_id }).await;
                    }
                    record_sweep_item("failed_provisions", true);
                    report.record_success();
                }
                Err(e) => {
                    record_sweep_item("failed_provisions", false);
                    report.record_failure(record.schema_name, e);
                }
            }
        }
        log_sweep("cleanup_failed_provisions", &report);
        Ok(report)
    }

    /// Binds a PROVISIONED, unassigned schema to `owner_id` and opens access.
    pub async fn assign_provision_to_school(
        &self,
        id: Uuid,
        owner_id: Uuid,
        assigned_by: &str,
    ) -> TenancyResult<ProvisionRecord> {
        let record = self.require(id).await?;
        if !record.is_provisioned() {
            return Err(TenancyError::InvalidProvisionState(format!(
                "{} is {}; only provisioned schemas can be assigned",
                record.schema_name, record.status
            )));
        }
        if let Some(current) = record.assigned_owner_id {
            return Err(TenancyError::InvalidProvisionState(format!(
                "{} is already assigned to {current}",
                record.schema_name
            )));
        }
        if let Some(bound) = self.store.find_by_owner(owner_id).await? {
            return Err(TenancyError::ProvisionConflict(format!(
                "{owner_id} is already bound to {}",
                bound.schema_name
            )));
        }

        self.schemas
            .assign_to_school(&record.schema_name, owner_id)
            .await?;
        let assigned = match self.store.assign(id, owner_id, assigned_by).await {
            Ok(Some(assigned)) => assigned,
            Ok(None) => {
                self.reset_credentials(&record.schema_name).await;
                return Err(TenancyError::InvalidProvisionState(format!(
                    "{} changed while it was being assigned",
                    record.schema_name
                )));
            }
            Err(e) => {
                self.reset_credentials(&record.schema_name).await;
                return Err(e);
            }
        };

        self.cache
            .apply(OwnerChange::Bound {
                owner_id,
                accessible: assigned.accessible,
            })
            .await;
        info!(
            "Assigned {} to {owner_id} (by {assigned_by})",
            assigned.schema_name
        );
        Ok(assigned)
    }

    async fn reset_credentials(&self, schema: &str) {
        if let Err(e) = self.schemas.unassign_from_school(schema).await {
            warn!("Could not reset credentials of {schema}: {e}");
        }
    }

    /// Clears the owner binding, closes access and resets the role credentials.
    pub async fn unassign_provision(&self, id: Uuid) -> TenancyResult<ProvisionRecord> {
        let record = self.require(id).await?;
        let Some(owner_id) = record.assigned_owner_id else {
            return Err(TenancyError::InvalidProvisionState(format!(
                "{} is not assigned",
                record.schema_name
            )));
        };

        let unassigned = self.store.unassign(id).await?.ok_or_else(|| {
            TenancyError::InvalidProvisionState(format!(
                "{} changed while it was being unassigned",
                record.schema_name
            ))
        })?;
        self.cache.apply(OwnerChange::Released { owner_id }).await;

        if self.schemas.schema_exists(&record.schema_name).await? {
            self.schemas
                .unassign_from_school(&record.schema_name)
                .await?;
        }
        info!("Unassigned {} from {owner_id}", record.schema_name);
        Ok(unassigned)
    }

    /// Opens or closes access for whatever schema `owner_id` is bound to.
    /// Returns `None` when the owner has no schema.
    pub async fn set_owner_access(
        &self,
        owner_id: Uuid,
        accessible: bool,
    ) -> TenancyResult<Option<ProvisionRecord>> {
        let Some(record) = self.store.find_by_owner(owner_id).await? else {
            self.cache.invalidate(owner_id).await;
            return Ok(None);
        };

        let updated = self
            .store
            .set_accessible(record.id, accessible)
            .await?
            .ok_or_else(|| {
                TenancyError::InvalidProvisionState(format!(
                    "{} is {}; access can only be opened on provisioned schemas",
                    record.schema_name, record.status
                ))
            })?;
        self.cache
            .apply(OwnerChange::AccessChanged {
                owner_id,
                accessible: updated.accessible,
            })
            .await;
        info!(
            "Access to {} for {owner_id} is now {}",
            updated.schema_name,
            if updated.accessible { "open" } else { "closed" }
        );
        Ok(Some(updated))
    }

    /// Closes access, drops the schema and deletes the record.
    pub async fn delete_provision(&self, id: Uuid) -> TenancyResult<()> {
        let record = self.require(id).await?;

        if let Some(owner_id) = record.assigned_owner_id {
            if record.accessible {
                self.store.set_accessible(id, false).await?;
            }
            self.cache.apply(OwnerChange::Released { owner_id }).await;
        }
        self.schemas
            .drop_schema_if_exists(&record.schema_name)
            .await?;
        self.store.delete(id).await?;
        info!("Deleted provision {} ({})", record.schema_name, record.id);
        Ok(())
    }

    /// A schema and its record must exist together or not at all.
    pub async fn is_provision_consistent(&self, schema: &str) -> TenancyResult<ConsistencyReport> {
        validate_schema_name(schema)?;
        let schema_exists = self.schemas.schema_exists(schema).await?;
        let record_exists = self.store.find_by_schema(schema).await?.is_some();
        Ok(ConsistencyReport {
            schema_name: schema.to_string(),
            schema_exists,
            record_exists,
            consistent: schema_exists == record_exists,
        })
    }

    /// A record without its schema is rebuilt; a schema without a record is
    /// dropped. A PENDING record updated within [`IN_FLIGHT_GRACE_MINUTES`]
    /// belongs to a provisioning still under way and is left alone.
    pub async fn repair_inconsistent_provision(&self, schema: &str) -> TenancyResult<RepairAction> {
        validate_schema_name(schema)?;
        // Existence before the record, as in `orchestrate_provisioning`.
        let schema_exists = self.schemas.schema_exists(schema).await?;
        let record = self.store.find_by_schema(schema).await?;

        match (record, schema_exists) {
            (Some(record), false) if is_in_flight(&record) => {
                info!("Repair: {schema} is still being provisioned, skipping");
                Ok(RepairAction::None)
            }
            (Some(record), false) => {
                info!("Repair: rebuilding missing schema {schema}");
                self.retry_provisioning(record.id).await?;
                Ok(RepairAction::RecreatedSchema)
            }
            (None, true) => {
                info!("Repair: dropping unrecorded schema {schema}");
                self.schemas.drop_schema(schema).await?;
                Ok(RepairAction::DroppedOrphanSchema)
            }
            _ => Ok(RepairAction::None),
        }
    }

    pub async fn get_provision(&self, id: Uuid) -> TenancyResult<ProvisionRecord> {
        self.require(id).await
    }

    pub async fn list_provisions(
        &self,
        filter: &ProvisionFilter,
    ) -> TenancyResult<Vec<ProvisionRecord>> {
        self.store.list(filter).await
    }

    pub async fn find_by_owner(&self, owner_id: Uuid) -> TenancyResult<Option<ProvisionRecord>> {
        self.store.find_by_owner(owner_id).await
    }

    pub async fn get_stats(&self) -> TenancyResult<ProvisionStats> {
        self.store.stats().await
    }

    async fn require(&self, id: Uuid) -> TenancyResult<ProvisionRecord> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or_else(|| TenancyError::ProvisionNotFound(id.to_string()))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn log_sweep(name: &str, report: &SweepReport) {
    if report.failed > 0 {
        warn!(
            "Sweep {name}: {}/{} succeeded, {} failed",
            report.succeeded, report.attempted, report.failed
        );
    } else {
        info!("Sweep {name}: {} item(s) processed", report.attempted);
    }
}
