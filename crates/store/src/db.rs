use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use novelgraph_core::config::PostgresConfig;

use crate::error::StoreError;

/// Create a PostgreSQL connection pool and run migrations.
///
/// Each worker process calls this after spawn, so pooled sockets are never
/// inherited across processes.
pub async fn init_pg_pool(config: &PostgresConfig) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await?;
    info!("PostgreSQL connected");

    sqlx::migrate!("../../migrations").run(&pool).await?;
    info!("database migrations applied");

    Ok(pool)
}
