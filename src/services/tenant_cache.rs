use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db::provisions::ProvisionStore;
use crate::error::{TenancyError, TenancyResult};
use crate::models::provision::ProvisionRecord;
use crate::services::access::OwnerActivityChecker;
use crate::services::cache::CacheBackend;
use crate::services::metrics::{ACCESS_CHECKS_COUNTER, CACHE_LOOKUPS_COUNTER};

#[derive(Debug, Clone, Copy)]
pub struct CacheSettings {
    pub schema_ttl: Duration,
    pub access_ttl: Duration,
    pub access_check_timeout: Duration,
}

impl CacheSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            schema_ttl: Duration::from_secs(config.schema_cache_ttl_secs),
            access_ttl: Duration::from_secs(config.access_cache_ttl_secs),
            access_check_timeout: config.access_check_timeout(),
        }
    }
}

pub fn schema_key(owner_id: Uuid) -> String {
    format!("tenant:schema:{owner_id}")
}

pub fn access_key(owner_id: Uuid) -> String {
    format!("tenant:access:{owner_id}")
}

/// A committed change to an owner's binding, mirrored into the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerChange {
    /// The owner now has a schema.
    Bound { owner_id: Uuid, accessible: bool },
    AccessChanged { owner_id: Uuid, accessible: bool },
    /// The owner has no schema any more.
    Released { owner_id: Uuid },
}

enum Access {
    /// Allowed by a cached entry.
    Cached,
    /// Allowed by a fresh check against this record.
    Verified(ProvisionRecord),
    Denied,
}

struct Computed {
    granted: Option<ProvisionRecord>,
    /// The record did not change while the decision was made.
    stable: bool,
}

fn version(record: &Option<ProvisionRecord>) -> Option<(Uuid, DateTime<Utc>)> {
    record.as_ref().map(|r| (r.id, r.updated_at))
}

/// Read-through cache of owner → schema and owner → access decisions.
///
/// The provisioning store stays authoritative. Entries are written only from
/// the store's current state, and every binding change is applied through
/// [`TenantCache::apply`] once the store write has committed.
pub struct TenantCache {
    backend: Arc<dyn CacheBackend>,
    store: Arc<dyn ProvisionStore>,
    checker: Arc<dyn OwnerActivityChecker>,
    settings: CacheSettings,
}

impl TenantCache {
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        store: Arc<dyn ProvisionStore>,
        checker: Arc<dyn OwnerActivityChecker>,
        settings: CacheSettings,
    ) -> Self {
        Self {
            backend,
            store,
            checker,
            settings,
        }
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    /// Resolves the schema serving `owner_id`. Access is checked first; a
    /// denied owner never reaches the schema lookup.
    pub async fn get_schema_for_school(&self, owner_id: Uuid) -> TenancyResult<String> {
        let key = schema_key(owner_id);
        match self.check_access(owner_id).await {
            Access::Denied => return Err(TenancyError::AccessDenied(owner_id)),
            Access::Verified(record) => {
                self.put(&key, &record.schema_name, self.settings.schema_ttl)
                    .await;
                return Ok(record.schema_name);
            }
            Access::Cached => {}
        }

        match self.backend.get(&key).await {
            Ok(Some(schema)) => {
                CACHE_LOOKUPS_COUNTER.with_label_values(&["schema", "hit"]).inc();
                return Ok(schema);
            }
            Ok(None) => {}
            Err(e) => warn!("Tenant cache: schema lookup for {owner_id} failed: {e}"),
        }
        CACHE_LOOKUPS_COUNTER.with_label_values(&["schema", "miss"]).inc();

        let record = self
            .store
            .find_by_owner(owner_id)
            .await?
            .ok_or_else(|| TenancyError::SchemaNotFound(format!("no schema bound to {owner_id}")))?;

        // A stale access entry allowed us this far; the record has the last word.
        if !record.accessible {
            self.delete(&[access_key(owner_id)]).await;
            return Err(TenancyError::AccessDenied(owner_id));
        }

        self.put(&key, &record.schema_name, self.settings.schema_ttl)
            .await;
        Ok(record.schema_name)
    }

    /// Fail-closed access decision. Store errors, checker errors and checks
    /// exceeding the timeout all deny, and are not cached.
    pub async fn has_access(&self, owner_id: Uuid) -> bool {
        !matches!(self.check_access(owner_id).await, Access::Denied)
    }

    async fn check_access(&self, owner_id: Uuid) -> Access {
        let key = access_key(owner_id);
        match self.backend.get(&key).await {
            Ok(Some(value)) => {
                CACHE_LOOKUPS_COUNTER.with_label_values(&["access", "hit"]).inc();
                return if value == "1" { Access::Cached } else { Access::Denied };
            }
            Ok(None) => {}
            Err(e) => warn!("Tenant cache: access lookup for {owner_id} failed: {e}"),
        }
        CACHE_LOOKUPS_COUNTER.with_label_values(&["access", "miss"]).inc();

        let computed = match tokio::time::timeout(
            self.settings.access_check_timeout,
            self.compute_access(owner_id),
        )
        .await
        {
            Ok(Ok(computed)) => computed,
            Ok(Err(e)) => {
                warn!("Access check for {owner_id} failed, denying: {e}");
                ACCESS_CHECKS_COUNTER.with_label_values(&["error"]).inc();
                return Access::Denied;
            }
            Err(_) => {
                warn!(
                    "Access check for {owner_id} exceeded {:?}, denying",
                    self.settings.access_check_timeout
                );
                ACCESS_CHECKS_COUNTER.with_label_values(&["timeout"]).inc();
                return Access::Denied;
            }
        };

        let allowed = computed.granted.is_some();
        ACCESS_CHECKS_COUNTER
            .with_label_values(&[if allowed { "allowed" } else { "denied" }])
            .inc();

        if !computed.stable {
            debug!("Tenant cache: binding of {owner_id} changed during the access check, not caching");
        } else if allowed {
            // A closing write that lands first keeps its "0".
            if let Err(e) = self
                .backend
                .set_nx_ex(&key, "1", self.settings.access_ttl)
                .await
            {
                warn!("Tenant cache: write of {key} failed: {e}");
            }
        } else {
            self.put(&key, "0", self.settings.access_ttl).await;
        }

        match computed.granted {
            Some(record) => Access::Verified(record),
            None => Access::Denied,
        }
    }

    /// Reads the record around the activity check so a change committed
    /// while the check runs is seen.
    async fn compute_access(&self, owner_id: Uuid) -> TenancyResult<Computed> {
        let before = self.store.find_by_owner(owner_id).await?;
        let open = before.as_ref().is_some_and(|r| r.accessible);
        let active = open && self.checker.is_owner_active(owner_id).await?;

        let after = self.store.find_by_owner(owner_id).await?;
        let stable = version(&before) == version(&after);
        Ok(Computed {
            granted: after.filter(|r| active && r.accessible),
            stable,
        })
    }

    /// Mirrors a committed binding change. Never fails: a write that cannot
    /// be applied falls back to evicting the owner's entries.
    ///
    /// Schema entries are only written from a record read under a passing
    /// access check, never from a binding change.
    pub async fn apply(&self, change: OwnerChange) {
        debug!("Tenant cache: applying {change:?}");
        match change {
            OwnerChange::Bound {
                owner_id,
                accessible,
            } => {
                self.delete(&[schema_key(owner_id)]).await;
                self.set_access(owner_id, accessible).await;
            }
            OwnerChange::AccessChanged {
                owner_id,
                accessible,
            } => self.set_access(owner_id, accessible).await,
            OwnerChange::Released { owner_id } => self.invalidate(owner_id).await,
        }
    }

    /// Closing writes "0" outright. Opening only evicts, since the activity
    /// check still has a say.
    async fn set_access(&self, owner_id: Uuid, accessible: bool) {
        if accessible {
            self.delete(&[access_key(owner_id)]).await;
        } else {
            self.put(&access_key(owner_id), "0", self.settings.access_ttl)
                .await;
        }
    }

    /// Drops both entries of an owner.
    pub async fn invalidate(&self, owner_id: Uuid) {
        self.delete(&[schema_key(owner_id), access_key(owner_id)])
            .await;
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) {
        if let Err(e) = self.backend.set_ex(key, value, ttl).await {
            warn!("Tenant cache: write of {key} failed, evicting: {e}");
            self.delete(&[key.to_string()]).await;
        }
    }

    async fn delete(&self, keys: &[String]) {
        if let Err(e) = self.backend.delete(keys).await {
            warn!("Tenant cache: eviction of {keys:?} failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::provision::AcademicLevel;
    use crate::testing::Harness;

    async fn bound_owner(h: &Harness) -> (Uuid, String) {
        let record = h
            .orchestrator
            .orchestrate_provisioning("school_cache", AcademicLevel::Primary, "ops")
            .await
            .unwrap();
        let owner = Uuid::new_v4();
        h.checker.set_active(owner, true);
        h.orchestrator
            .assign_provision_to_school(record.id, owner, "ops")
            .await
            .unwrap();
        (owner, record.schema_name)
    }

    #[tokio::test]
    async fn resolves_and_caches_schema_of_accessible_owner() {
        let h = Harness::new();
        let (owner, schema) = bound_owner(&h).await;

        assert_eq!(h.cache.get_schema_for_school(owner).await.unwrap(), schema);
        assert_eq!(
            h.backend.get(&schema_key(owner)).await.unwrap().as_deref(),
            Some(schema.as_str())
        );
        assert_eq!(
            h.backend.get(&access_key(owner)).await.unwrap().as_deref(),
            Some("1")
        );
    }

    #[tokio::test]
    async fn unknown_owner_is_denied() {
        let h = Harness::new();
        let owner = Uuid::new_v4();

        assert!(!h.cache.has_access(owner).await);
        assert!(matches!(
            h.cache.get_schema_for_school(owner).await,
            Err(TenancyError::AccessDenied(id)) if id == owner
        ));
    }

    #[tokio::test]
    async fn inactive_owner_is_denied_even_with_an_accessible_record() {
        let h = Harness::new();
        let (owner, _) = bound_owner(&h).await;
        h.checker.set_active(owner, false);

        assert!(!h.cache.has_access(owner).await);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_access_check_fails_closed_and_is_not_cached() {
        let h = Harness::new();
        let (owner, _) = bound_owner(&h).await;
        h.checker.set_delay(Duration::from_secs(60));

        assert!(!h.cache.has_access(owner).await);
        assert_eq!(h.backend.get(&access_key(owner)).await.unwrap(), None);

        h.checker.set_delay(Duration::ZERO);
        assert!(h.cache.has_access(owner).await);
    }

    #[tokio::test]
    async fn checker_errors_deny_without_caching() {
        let h = Harness::new();
        let (owner, _) = bound_owner(&h).await;
        h.checker.set_failing(true);

        assert!(!h.cache.has_access(owner).await);
        assert_eq!(h.backend.get(&access_key(owner)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn closing_access_takes_effect_through_a_warm_cache() {
        let h = Harness::new();
        let (owner, _) = bound_owner(&h).await;
        h.cache.get_schema_for_school(owner).await.unwrap();

        h.orchestrator.set_owner_access(owner, false).await.unwrap();

        assert!(matches!(
            h.cache.get_schema_for_school(owner).await,
            Err(TenancyError::AccessDenied(_))
        ));
    }

    #[tokio::test]
    async fn released_owner_loses_both_entries() {
        let h = Harness::new();
        let (owner, _) = bound_owner(&h).await;
        h.cache.get_schema_for_school(owner).await.unwrap();

        h.cache.apply(OwnerChange::Released { owner_id: owner }).await;

        assert_eq!(h.backend.get(&schema_key(owner)).await.unwrap(), None);
        assert_eq!(h.backend.get(&access_key(owner)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn stale_access_entry_is_overruled_by_the_record() {
        let h = Harness::new();
        let (owner, _) = bound_owner(&h).await;
        let record = h.store.find_by_owner(owner).await.unwrap().unwrap();
        // Record closed behind the cache's back, access entry still says yes.
        h.backend
            .set_ex(&access_key(owner), "1", Duration::from_secs(60))
            .await
            .unwrap();
        h.store.set_accessible(record.id, false).await.unwrap();

        assert!(matches!(
            h.cache.get_schema_for_school(owner).await,
            Err(TenancyError::AccessDenied(_))
        ));
        assert_eq!(h.backend.get(&access_key(owner)).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn access_closed_during_a_check_is_not_reopened() {
        let h = Harness::new();
        let (owner, _) = bound_owner(&h).await;
        h.checker.set_delay(Duration::from_secs(1));

        let cache = h.cache.clone();
        let in_flight = tokio::spawn(async move { cache.has_access(owner).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.orchestrator.set_owner_access(owner, false).await.unwrap();

        assert!(!in_flight.await.unwrap());
        assert_eq!(
            h.backend.get(&access_key(owner)).await.unwrap().as_deref(),
            Some("0")
        );
        assert!(matches!(
            h.cache.get_schema_for_school(owner).await,
            Err(TenancyError::AccessDenied(_))
        ));
    }
}
