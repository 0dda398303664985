pub mod mirror;
pub mod sync;

use shopmirror_common::error::{MirrorError, MirrorResult};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Create a Postgres connection pool from a database URL.
pub async fn create_pool(database_url: &str) -> MirrorResult<PgPool> {
    tracing::info!("connecting to database");
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .map_err(|e| MirrorError::Database(e.to_string()))
}

/// Apply the bundled schema migrations.
pub async fn migrate(pool: &PgPool) -> MirrorResult<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| MirrorError::Database(e.to_string()))
}
