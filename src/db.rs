// llmlb — embedded store bootstrap
//
// Single sqlite database at ~/.llmlb/llmlb.db. Migrations are forward-only
// and applied at startup; the sqlx migrations table carries the schema
// version.

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

pub async fn connect(state_dir: &Path) -> anyhow::Result<SqlitePool> {
    std::fs::create_dir_all(state_dir)?;
    let db_path = state_dir.join("llmlb.db");

    let options = SqliteConnectOptions::new()
        .filename(&db_path)
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(3))
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    tracing::info!("store ready at {}", db_path.display());
    Ok(pool)
}

/// In-memory store for tests. Same schema, no file.
pub async fn connect_in_memory() -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(":memory:")
        .foreign_keys(true);

    // A single pinned connection: every handle must see the same in-memory
    // DB, and the pool must never recycle it away.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}
