//! Schema migrations for the materialization tables
//!
//! Migrations are embedded at compile time from `cadence-storage/migrations`.

use crate::{Error, Result};
use sqlx::migrate::Migrator;
use sqlx::PgPool;
use tracing::info;

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Bring the schema up to date; already-applied migrations are skipped
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    MIGRATOR
        .run(pool)
        .await
        .map_err(|e| Error::Migration(e.to_string()))?;

    let latest = MIGRATOR.iter().map(|m| m.version).max().unwrap_or_default();
    info!(schema_version = latest, "Materialization schema is up to date");
    Ok(())
}
