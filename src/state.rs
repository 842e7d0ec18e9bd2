use std::sync::Arc;

use sqlx::PgPool;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::{
    self,
    migrations::{MigrationLocations, PgMigrationRunner},
    provisions::PgProvisionStore,
    schema_manager::PgSchemaManager,
};
use crate::services::{
    access::SchoolActivityChecker,
    cache::{CacheBackend, MemoryCache, RedisCache},
    orchestrator::ProvisioningOrchestrator,
    schools::SchoolService,
    tenant_cache::{CacheSettings, TenantCache},
};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub config: Arc<Config>,
    pub cache_backend: Arc<dyn CacheBackend>,
    pub cache: Arc<TenantCache>,
    pub orchestrator: Arc<ProvisioningOrchestrator>,
    pub schools: Arc<SchoolService>,
}

impl AppState {
    pub fn new(
        db: PgPool,
        config: Arc<Config>,
        cache_backend: Arc<dyn CacheBackend>,
        cache: Arc<TenantCache>,
        orchestrator: Arc<ProvisioningOrchestrator>,
    ) -> Self {
        let schools = Arc::new(SchoolService::new(db.clone(), orchestrator.clone()));
        Self {
            db,
            config,
            cache_backend,
            cache,
            orchestrator,
            schools,
        }
    }

    /// Connects to PostgreSQL and the cache, applies the control-plane
    /// migrations and wires the production components together.
    pub async fn connect(config: Config) -> anyhow::Result<Self> {
        let config = Arc::new(config);

        let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
        db::run_migrations(&pool).await?;
        info!("Database connected and control-plane migrations applied");

        let cache_backend: Arc<dyn CacheBackend> = match &config.redis_url {
            Some(url) => {
                let redis = RedisCache::connect(url).await?;
                info!("Redis connected");
                Arc::new(redis)
            }
            None => {
                warn!("REDIS_URL not set, using the in-process tenant cache (single instance only)");
                Arc::new(MemoryCache::new())
            }
        };

        let store = Arc::new(PgProvisionStore::new(pool.clone()));
        let schemas = Arc::new(PgSchemaManager::new(pool.clone(), &config));
        let migrations = Arc::new(PgMigrationRunner::new(
            pool.clone(),
            MigrationLocations::new(&config.tenant_migrations_dir),
            &config.default_schema,
        ));
        let cache = Arc::new(TenantCache::new(
            cache_backend.clone(),
            store.clone(),
            Arc::new(SchoolActivityChecker::new(pool.clone())),
            CacheSettings::from_config(&config),
        ));
        let orchestrator = Arc::new(ProvisioningOrchestrator::new(
            schemas,
            migrations,
            store,
            cache.clone(),
        ));

        Ok(Self::new(pool, config, cache_backend, cache, orchestrator))
    }
}
