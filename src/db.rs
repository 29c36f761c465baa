//! Database module
//!
//! Connection pool setup and schema verification.
//! The schema itself lives in `migrations/` as raw SQL.

use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};

use crate::config::Config;

/// Tables the services read and write
pub const REQUIRED_TABLES: &[&str] = &[
    "permissions",
    "roles",
    "role_permissions",
    "assignments",
    "directory_users",
    "outbox_events",
];

/// Open the connection pool
pub async fn connect(config: &Config) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
}

/// Verify database connectivity
pub async fn verify_connection(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Check if required tables exist
pub async fn check_schema(pool: &PgPool) -> Result<bool, sqlx::Error> {
    for table in REQUIRED_TABLES {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                WHERE table_schema = 'public' AND table_name = $1
            )
            "#,
        )
        .bind(*table)
        .fetch_one(pool)
        .await?;

        if !exists {
            tracing::error!("Required table '{}' does not exist", table);
            return Ok(false);
        }
    }

    Ok(true)
}

/// Apply `migrations/0001_init.sql`; every statement is idempotent
pub async fn apply_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    pool.execute(include_str!("../migrations/0001_init.sql"))
        .await?;
    tracing::info!("Database schema applied");
    Ok(())
}
