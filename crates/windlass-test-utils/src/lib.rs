//! Shared test utilities for windlass integration tests.
//!
//! Each test gets its own SQLite database in a fresh temporary directory,
//! with migrations applied. The [`tempfile::TempDir`] must be kept alive for
//! the lifetime of the pool; dropping it deletes the database.

use anyhow::Context;
use sqlx::SqlitePool;
use tempfile::TempDir;

use windlass_db::config::DbConfig;
use windlass_db::pool;

/// Create a fresh file-backed test database with the schema applied.
///
/// Returns the pool and the temp dir guard. Panics on failure -- these are
/// test fixtures, not production paths.
pub async fn create_test_db() -> (SqlitePool, TempDir) {
    let dir = TempDir::new().expect("failed to create temp dir for test db");
    let db_path = dir.path().join("windlass.db");
    let config = DbConfig::new(format!("sqlite://{}?mode=rwc", db_path.display()));

    let pool = pool::create_pool(&config)
        .await
        .context("failed to create test pool")
        .unwrap();
    pool::run_migrations(&pool, pool::default_migrations_path())
        .await
        .context("failed to migrate test db")
        .unwrap();

    (pool, dir)
}

/// Install a tracing subscriber honoring `RUST_LOG`, once per process.
///
/// Safe to call from every test; subsequent calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
