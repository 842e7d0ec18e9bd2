use std::sync::Arc;

use lazy_static::lazy_static;
use prometheus::{register_counter_vec, register_gauge_vec, CounterVec, GaugeVec};
use tracing::{debug, warn};

use crate::db::provisions::ProvisionStore;

lazy_static! {
    // ── Event counters ──────────────────────────────────────────────────────
    pub static ref PROVISIONING_COUNTER: CounterVec = register_counter_vec!(
        "tenancy_provisioning_total",
        "Provisioning attempts by outcome (provisioned, failed, conflict)",
        &["outcome"]
    ).unwrap();

    pub static ref CACHE_LOOKUPS_COUNTER: CounterVec = register_counter_vec!(
        "tenancy_cache_lookups_total",
        "Tenant cache lookups by entry kind and result",
        &["entry", "result"]
    ).unwrap();

    pub static ref ACCESS_CHECKS_COUNTER: CounterVec = register_counter_vec!(
        "tenancy_access_checks_total",
        "Computed access decisions (allowed, denied, timeout, error)",
        &["outcome"]
    ).unwrap();

    pub static ref SWEEP_ITEMS_COUNTER: CounterVec = register_counter_vec!(
        "tenancy_sweep_items_total",
        "Items processed by administrative sweeps",
        &["sweep", "outcome"]
    ).unwrap();

    // ── Snapshot ────────────────────────────────────────────────────────────
    pub static ref PROVISIONS_GAUGE: GaugeVec = register_gauge_vec!(
        "tenancy_provisions",
        "Provisioning records by status",
        &["status"]
    ).unwrap();
}

/// Counts one sweep item under `sweep` as ok or error.
pub fn record_sweep_item(sweep: &str, ok: bool) {
    SWEEP_ITEMS_COUNTER
        .with_label_values(&[sweep, if ok { "ok" } else { "error" }])
        .inc();
}

/// Spawn the background collector refreshing the status gauges every 5 minutes.
pub fn start(store: Arc<dyn ProvisionStore>) {
    tokio::spawn(async move {
        loop {
            if let Err(e) = collect(store.as_ref()).await {
                warn!("Metrics: collection failed: {e}");
            }
            tokio::time::sleep(tokio::time::Duration::from_secs(300)).await;
        }
    });
}

async fn collect(store: &dyn ProvisionStore) -> anyhow::Result<()> {
    let stats = store.stats().await?;
    PROVISIONS_GAUGE
        .with_label_values(&["provisioned"])
        .set(stats.provisioned as f64);
    PROVISIONS_GAUGE
        .with_label_values(&["pending"])
        .set(stats.pending as f64);
    PROVISIONS_GAUGE
        .with_label_values(&["failed"])
        .set(stats.failed as f64);
    debug!("Metrics: {} provisioning record(s)", stats.total);
    Ok(())
}
