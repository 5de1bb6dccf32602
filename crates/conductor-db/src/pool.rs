//! Connection pooling and schema management.
//!
//! `prepare_database` is the one-stop path used by `conductor db-init`:
//! it creates the database when absent, connects with the configured
//! pool size, and applies the migrations shipped with this crate.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use tracing::info;

use crate::config::DbConfig;

/// How long pool acquisition may block before erroring.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Open a pool against the configured database.
pub async fn create_pool(config: &DbConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(&config.database_url)
        .await
        .with_context(|| {
            format!("failed to connect to database at {}", config.database_url)
        })
}

/// Full initialization: create the target database when absent, connect,
/// and bring the schema up to date. Returns the ready pool.
pub async fn prepare_database(config: &DbConfig) -> Result<PgPool> {
    ensure_database_exists(config).await?;
    let pool = create_pool(config).await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

/// Run all pending migrations shipped with `conductor-db` against the
/// pool.
///
/// Uses a runtime `Migrator` so that no running database is required at
/// compile time (unlike the `sqlx::migrate!()` macro).
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    run_migrations_from(pool, default_migrations_path()).await
}

/// Run all pending migrations from the given directory against the pool.
pub async fn run_migrations_from(pool: &PgPool, migrations_dir: &Path) -> Result<()> {
    let migrator = sqlx::migrate::Migrator::new(migrations_dir)
        .await
        .with_context(|| {
            format!(
                "failed to load migrations from {}",
                migrations_dir.display()
            )
        })?;

    migrator
        .run(pool)
        .await
        .context("failed to run database migrations")?;

    info!("migrations applied successfully");
    Ok(())
}

/// Single-connection pool against the `postgres` maintenance database on
/// the same server, for `CREATE DATABASE` and similar statements.
async fn maintenance_pool(config: &DbConfig) -> Result<PgPool> {
    let url = config.maintenance_url();
    PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(&url)
        .await
        .with_context(|| format!("failed to connect to maintenance database at {url}"))
}

/// Ensure the target database exists, creating it if necessary.
pub async fn ensure_database_exists(config: &DbConfig) -> Result<()> {
    let db_name = config
        .database_name()
        .context("could not determine database name from URL")?;

    // CREATE DATABASE cannot be parameterised, so the name is validated
    // before it is spliced into DDL.
    if !valid_database_name(db_name) {
        bail!("database name {db_name:?} contains invalid characters");
    }

    let maint = maintenance_pool(config).await?;

    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(db_name)
            .fetch_one(&maint)
            .await
            .context("failed to query pg_database")?;

    if exists {
        info!(db = db_name, "database already exists");
    } else {
        maint
            .execute(format!("CREATE DATABASE {db_name}").as_str())
            .await
            .with_context(|| format!("failed to create database {db_name}"))?;
        info!(db = db_name, "database created");
    }

    maint.close().await;
    Ok(())
}

/// Conservative identifier check for names spliced into DDL: leading
/// ASCII letter or underscore, then letters, digits, or underscores.
fn valid_database_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Row counts for every user-defined table in the `public` schema, for
/// the `conductor db-init` success report.
pub async fn table_counts(pool: &PgPool) -> Result<Vec<(String, i64)>> {
    let tables: Vec<String> = sqlx::query_scalar(
        "SELECT tablename::text \
         FROM pg_tables \
         WHERE schemaname = 'public' \
         ORDER BY tablename",
    )
    .fetch_all(pool)
    .await
    .context("failed to list tables")?;

    let mut counts = Vec::with_capacity(tables.len());
    for table in tables {
        // Names come from pg_tables, so they are safe identifiers.
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(pool)
            .await
            .with_context(|| format!("failed to count rows in {table}"))?;
        counts.push((table, count));
    }
    Ok(counts)
}

/// Return the default path to the migrations directory shipped with
/// `conductor-db`.
///
/// At runtime this resolves relative to the `conductor-db` crate's source
/// tree via the `CARGO_MANIFEST_DIR` compile-time env.
pub fn default_migrations_path() -> &'static Path {
    Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/migrations"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_database_names_accepted() {
        assert!(valid_database_name("conductor"));
        assert!(valid_database_name("conductor_test_1"));
        assert!(valid_database_name("_scratch"));
    }

    #[test]
    fn invalid_database_names_rejected() {
        assert!(!valid_database_name(""));
        assert!(!valid_database_name("1starts_with_digit"));
        assert!(!valid_database_name("bad-dash"));
        assert!(!valid_database_name("injection;drop"));
        assert!(!valid_database_name("spaced name"));
    }

    #[test]
    fn migrations_path_points_into_this_crate() {
        let path = default_migrations_path();
        assert!(path.ends_with("migrations"));
    }
}
