use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::services::cache::CacheBackend;
use crate::services::orchestrator::ProvisioningOrchestrator;

const SWEEP_LOCK_KEY: &str = "tenancy:sweep:lock";

/// Spawn the periodic maintenance sweep. Every `interval` it deletes FAILED
/// provisions older than `max_age_days` and reports orphans in either
/// direction. Orphans are only logged; removing them stays an operator call.
///
/// A cache lock held for one interval keeps concurrent instances from
/// sweeping at the same time.
pub fn start(
    orchestrator: Arc<ProvisioningOrchestrator>,
    cache: Arc<dyn CacheBackend>,
    interval: Duration,
    max_age_days: i64,
) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;

            match cache.try_lock(SWEEP_LOCK_KEY, interval).await {
                Ok(true) => {}
                Ok(false) => {
                    info!("Provision sweep: another instance holds the lock, skipping");
                    continue;
                }
                Err(e) => {
                    warn!("Provision sweep: lock unavailable: {e}");
                    continue;
                }
            }

            sweep(&orchestrator, max_age_days).await;
        }
    });
}

async fn sweep(orchestrator: &ProvisioningOrchestrator, max_age_days: i64) {
    match orchestrator.cleanup_failed_provisions(max_age_days).await {
        Ok(report) if report.attempted > 0 => info!(
            "Provision sweep: removed {}/{} failed provision(s) older than {max_age_days} days",
            report.succeeded, report.attempted
        ),
        Ok(_) => {}
        Err(e) => warn!("Provision sweep: failed-provision cleanup failed: {e}"),
    }

    match orchestrator.find_orphaned_provisions().await {
        Ok(orphans) if !orphans.is_empty() => {
            let names: Vec<&str> = orphans.iter().map(|r| r.schema_name.as_str()).collect();
            warn!(
                "Provision sweep: {} record(s) without a schema: {}",
                names.len(),
                names.join(", ")
            );
        }
        Ok(_) => {}
        Err(e) => warn!("Provision sweep: orphaned provision scan failed: {e}"),
    }

    match orchestrator.find_orphaned_schemas().await {
        Ok(orphans) if !orphans.is_empty() => warn!(
            "Provision sweep: {} schema(s) without a record: {}",
            orphans.len(),
            orphans.join(", ")
        ),
        Ok(_) => {}
        Err(e) => warn!("Provision sweep: orphaned schema scan failed: {e}"),
    }
}
