use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    create_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create the state tables. Idempotent.
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    // Last processed counter per pass and space
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS checkpoints (
            pass TEXT NOT NULL,
            space TEXT NOT NULL,
            counter INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (pass, space)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One row per pass invocation
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            run_id TEXT NOT NULL,
            pass TEXT NOT NULL,
            space TEXT NOT NULL,
            dry_run INTEGER NOT NULL,
            started_at INTEGER NOT NULL,
            finished_at INTEGER,
            ok INTEGER NOT NULL DEFAULT 0,
            nok INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (run_id, pass)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_started_at ON runs(started_at DESC)")
        .execute(pool)
        .await?;

    Ok(())
}
