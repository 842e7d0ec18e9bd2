pub mod health;
pub mod metrics;
pub mod provisions;
pub mod schools;
pub mod tenant_info;

use axum::{
    http::{header, HeaderName, Method},
    routing::{get, post},
    Router,
};
use tower_http::cors::{AllowHeaders, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::AppState;

/// Builds the HTTP surface: admin control plane, tenant-routed info and the
/// ambient health and metrics endpoints.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(AllowHeaders::list([
            header::CONTENT_TYPE,
            header::ACCEPT,
            HeaderName::from_static("x-tenant"),
            HeaderName::from_static("x-super-admin-key"),
        ]))
        .allow_origin(Any);

    Router::new()
        .route("/health", get(health::health_check))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/tenant/info", get(tenant_info::get_tenant_info))
        // Provisions
        .route("/admin/provisions", get(provisions::list_provisions).post(provisions::create_provision))
        .route("/admin/provisions/stats", get(provisions::get_stats))
        .route("/admin/provisions/migrate", post(provisions::migrate_all))
        .route("/admin/provisions/cleanup-failed", post(provisions::cleanup_failed))
        .route("/admin/provisions/{id}", get(provisions::get_provision).delete(provisions::delete_provision))
        .route("/admin/provisions/{id}/retry", post(provisions::retry_provision))
        .route("/admin/provisions/{id}/migrate", post(provisions::migrate_provision))
        .route("/admin/provisions/{id}/up-to-date", get(provisions::up_to_date))
        .route("/admin/provisions/{id}/assign", post(provisions::assign_provision))
        .route("/admin/provisions/{id}/unassign", post(provisions::unassign_provision))
        // Orphans and consistency
        .route("/admin/orphans/provisions", get(provisions::list_orphaned_provisions))
        .route("/admin/orphans/provisions/recover", post(provisions::recover_orphaned_provisions))
        .route("/admin/orphans/schemas", get(provisions::list_orphaned_schemas))
        .route("/admin/orphans/schemas/cleanup", post(provisions::cleanup_orphaned_schemas))
        .route("/admin/schemas/{name}/consistency", get(provisions::check_consistency))
        .route("/admin/schemas/{name}/repair", post(provisions::repair_consistency))
        // Schools
        .route("/admin/schools", post(schools::register_school))
        .route("/admin/schools/{id}", axum::routing::delete(schools::delete_school))
        .route("/admin/schools/{id}/suspend", post(schools::suspend_school))
        .route("/admin/schools/{id}/activate", post(schools::activate_school))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
