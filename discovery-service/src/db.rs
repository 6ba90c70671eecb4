//! Pooled Postgres access and embedded migrations.

use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Schema migrations compiled into the binary; run at startup and by tests.
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Connect a shared pool. Every statement in the service executes on this
/// pool as its own implicit transaction; there are no cross-statement
/// transactions anywhere in the pipeline.
pub async fn connect(database_url: &str) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(16)
        .connect(database_url)
        .await?;

    sqlx::query("SELECT 1").execute(&pool).await?;

    Ok(pool)
}
