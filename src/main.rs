use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scolaris_api::{
    config::Config,
    routes,
    services::{metrics, provision_scheduler},
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let state = AppState::connect(config).await?;

    // Tenant scripts shipped since the last start are applied before serving.
    let report = state.orchestrator.migrate_all_provisioned().await?;
    if report.failed > 0 {
        warn!(
            "{} tenant schema(s) failed to migrate at startup; see the logs above",
            report.failed
        );
    }
    info!("Tenant schemas migrated: {}/{}", report.succeeded, report.attempted);

    metrics::start(state.orchestrator.store().clone());
    if state.config.sweep_interval_secs > 0 {
        provision_scheduler::start(
            state.orchestrator.clone(),
            state.cache_backend.clone(),
            Duration::from_secs(state.config.sweep_interval_secs),
            state.config.failed_provision_max_age_days,
        );
    } else {
        info!("Provision sweep disabled (SWEEP_INTERVAL_SECS=0)");
    }

    let addr = format!("{}:{}", state.config.host, state.config.port);
    let app = routes::app(state);
    info!("Scolaris control plane listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
