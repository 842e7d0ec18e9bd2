pub mod migrations;
pub mod provisions;
pub mod schema_manager;

use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool};

/// Schema holding the control-plane tables (see ./migrations/).
pub const CONTROL_SCHEMA: &str = "tenancy";

/// The pool is shared by every tenant. A connection going back to the pool
/// drops whatever search path a request left on it; requests re-apply theirs
/// on every checkout.
pub async fn create_pool(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .after_release(|conn, _meta| {
            Box::pin(async move {
                sqlx::query("RESET search_path").execute(&mut *conn).await?;
                Ok(true)
            })
        })
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run the control-plane migrations embedded from ./migrations/
pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Runs `sql` over the simple query protocol, so it may hold several
/// statements. Takes a concrete connection: a generic executor borrowed from
/// a transaction inside an `#[async_trait]` method does not satisfy `Send`.
pub(crate) async fn execute_script(conn: &mut PgConnection, sql: &str) -> Result<(), sqlx::Error> {
    sqlx::Executor::execute(conn, sqlx::raw_sql(sql)).await?;
    Ok(())
}
