//! Resume offsets and the run journal.
//!
//! Each pass advances its checkpoint after every record, so `--resume`
//! restarts at the first record that was never attempted. The audit logs
//! are append-only and keyed by the same counter.

use anyhow::Result;
use sqlx::SqlitePool;

pub async fn get_checkpoint(pool: &SqlitePool, pass: &str, space: &str) -> Result<Option<u64>> {
    let result: Option<i64> =
        sqlx::query_scalar("SELECT counter FROM checkpoints WHERE pass = ? AND space = ?")
            .bind(pass)
            .bind(space)
            .fetch_optional(pool)
            .await?;

    Ok(result.and_then(|n| u64::try_from(n).ok()))
}

pub async fn set_checkpoint(pool: &SqlitePool, pass: &str, space: &str, counter: u64) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO checkpoints (pass, space, counter, updated_at) VALUES (?, ?, ?, ?)
        ON CONFLICT(pass, space) DO UPDATE SET counter = excluded.counter, updated_at = excluded.updated_at
        "#,
    )
    .bind(pass)
    .bind(space)
    .bind(counter as i64)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn clear_checkpoint(pool: &SqlitePool, pass: &str, space: &str) -> Result<()> {
    sqlx::query("DELETE FROM checkpoints WHERE pass = ? AND space = ?")
        .bind(pass)
        .bind(space)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn start_run(
    pool: &SqlitePool,
    run_id: &str,
    pass: &str,
    space: &str,
    dry_run: bool,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO runs (run_id, pass, space, dry_run, started_at) VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(run_id, pass) DO UPDATE SET started_at = excluded.started_at
        "#,
    )
    .bind(run_id)
    .bind(pass)
    .bind(space)
    .bind(dry_run as i64)
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn finish_run(pool: &SqlitePool, run_id: &str, pass: &str, ok: u64, nok: u64) -> Result<()> {
    sqlx::query("UPDATE runs SET finished_at = ?, ok = ?, nok = ? WHERE run_id = ? AND pass = ?")
        .bind(chrono::Utc::now().timestamp())
        .bind(ok as i64)
        .bind(nok as i64)
        .bind(run_id)
        .bind(pass)
        .execute(pool)
        .await?;
    Ok(())
}

/// A finished or interrupted pass invocation.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunRecord {
    pub run_id: String,
    pub pass: String,
    pub space: String,
    pub dry_run: i64,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub ok: i64,
    pub nok: i64,
}

pub async fn recent_runs(pool: &SqlitePool, limit: i64) -> Result<Vec<RunRecord>> {
    let rows = sqlx::query_as::<_, RunRecord>(
        "SELECT run_id, pass, space, dry_run, started_at, finished_at, ok, nok FROM runs ORDER BY started_at DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Which records a pass should attempt this invocation.
///
/// Counters are 1-based positions in the sorted pass input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Window {
    pub offset: u64,
    pub limit: Option<u64>,
}

impl Window {
    /// Explicit `--offset` wins over a stored checkpoint; `--resume` starts
    /// right after the checkpoint.
    pub fn resolve(offset: Option<u64>, limit: Option<u64>, resume_from: Option<u64>) -> Self {
        let offset = match (offset, resume_from) {
            (Some(o), _) => o.max(1),
            (None, Some(done)) => done + 1,
            (None, None) => 1,
        };
        Self { offset, limit }
    }

    pub fn contains(&self, counter: u64) -> bool {
        counter >= self.offset
            && self
                .limit
                .map_or(true, |limit| counter < self.offset.saturating_add(limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrate::create_schema(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_checkpoint_roundtrip() {
        let pool = memory_pool().await;
        assert_eq!(get_checkpoint(&pool, "tickets", "EA").await.unwrap(), None);
        set_checkpoint(&pool, "tickets", "EA", 10).await.unwrap();
        set_checkpoint(&pool, "tickets", "EA", 11).await.unwrap();
        set_checkpoint(&pool, "comments", "EA", 3).await.unwrap();
        assert_eq!(get_checkpoint(&pool, "tickets", "EA").await.unwrap(), Some(11));
        clear_checkpoint(&pool, "tickets", "EA").await.unwrap();
        assert_eq!(get_checkpoint(&pool, "tickets", "EA").await.unwrap(), None);
        assert_eq!(get_checkpoint(&pool, "comments", "EA").await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_run_journal() {
        let pool = memory_pool().await;
        start_run(&pool, "r1", "tickets", "EA", false).await.unwrap();
        finish_run(&pool, "r1", "tickets", 5, 2).await.unwrap();
        let runs = recent_runs(&pool, 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].ok, 5);
        assert_eq!(runs[0].nok, 2);
        assert!(runs[0].finished_at.is_some());
    }

    #[test]
    fn test_window() {
        let w = Window::resolve(None, None, None);
        assert!(w.contains(1));
        let w = Window::resolve(None, Some(2), Some(4));
        assert!(!w.contains(4));
        assert!(w.contains(5));
        assert!(w.contains(6));
        assert!(!w.contains(7));
        let w = Window::resolve(Some(2), None, Some(40));
        assert!(w.contains(2));
        assert!(!w.contains(1));
    }
}
