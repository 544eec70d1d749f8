//! The run store: a durable, append-mostly log of runs and the outcome of
//! every task they executed. It is the only source of truth for
//! `--retry-failed`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use derive_getters::Getters;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::executor::{Status, TaskResult};
use crate::log::*;
use crate::plan::{FailureHistory, TaskKey};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    run_id INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    total_tasks INTEGER,
    tasks_ok INTEGER,
    tasks_needs_attention INTEGER,
    tasks_failed INTEGER,
    command_args TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
    task_id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL,
    site_name TEXT NOT NULL,
    plugin_slug TEXT NOT NULL,
    status TEXT NOT NULL,
    from_version TEXT,
    to_version TEXT,
    backup_path TEXT,
    http_code TEXT,
    maintenance_cleared TEXT,
    error_message TEXT,
    stdout TEXT,
    stderr TEXT,
    duration_ms INTEGER,
    started_at TEXT,
    ended_at TEXT,
    FOREIGN KEY (run_id) REFERENCES runs(run_id)
);

CREATE INDEX IF NOT EXISTS idx_tasks_run_id ON tasks(run_id);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_site_plugin ON tasks(site_name, plugin_slug);
"#;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed creating state directory {}", .path.display())]
    StateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("run {0} not found")]
    RunNotFound(i64),
}

/// Aggregate counters of a run. Built from the finished result collection;
/// `ok + needs_attention + failed == total` always holds.
#[derive(Getters, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    total: usize,
    ok: usize,
    needs_attention: usize,
    failed: usize,
}

impl RunStats {
    pub fn from_results(results: &[TaskResult]) -> Self {
        results.iter().fold(Self::default(), |mut stats, result| {
            stats.total += 1;
            match result.status() {
                Status::Ok => stats.ok += 1,
                Status::NeedsAttention => stats.needs_attention += 1,
                Status::Failed => stats.failed += 1,
            }
            stats
        })
    }

    pub fn count(&self, status: Status) -> usize {
        match status {
            Status::Ok => self.ok,
            Status::NeedsAttention => self.needs_attention,
            Status::Failed => self.failed,
        }
    }

    /// Whether every task ended `ok`.
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.needs_attention == 0
    }
}

/// A row of the `runs` table. Counters stay empty until the run is closed.
#[derive(Getters, Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct RunRecord {
    run_id: i64,
    started_at: String,
    ended_at: Option<String>,
    total_tasks: Option<i64>,
    tasks_ok: Option<i64>,
    tasks_needs_attention: Option<i64>,
    tasks_failed: Option<i64>,
    command_args: String,
}

/// A row of the `tasks` table.
#[derive(Getters, Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct TaskRecord {
    task_id: i64,
    run_id: i64,
    site_name: String,
    plugin_slug: String,
    status: String,
    from_version: Option<String>,
    to_version: Option<String>,
    backup_path: Option<String>,
    http_code: Option<String>,
    maintenance_cleared: Option<String>,
    error_message: Option<String>,
    stdout: Option<String>,
    stderr: Option<String>,
    duration_ms: Option<i64>,
    started_at: Option<String>,
    ended_at: Option<String>,
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

/// SQLite-backed run log. Every operation checks a connection out of the
/// pool for the duration of its statement only, so concurrent writers never
/// share one.
#[derive(Debug, Clone)]
pub struct RunStore {
    pool: SqlitePool,
}

impl RunStore {
    /// Open (creating if needed) the database at `path` and make sure the
    /// schema exists.
    #[tracing::instrument]
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::StateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        debug!("store: opened {}", path.display());

        Ok(Self { pool })
    }

    /// Open a new run and return its id.
    #[tracing::instrument(skip(self))]
    pub async fn create_run(&self, command_line: &str) -> Result<i64, StoreError> {
        let run_id = sqlx::query("INSERT INTO runs (started_at, command_args) VALUES (?, ?)")
            .bind(now_rfc3339())
            .bind(command_line)
            .execute(&self.pool)
            .await?
            .last_insert_rowid();
        info!("created run {}", run_id);
        Ok(run_id)
    }

    /// Append one task outcome to `run_id`. Rows are never updated later.
    #[tracing::instrument(skip(self, result), fields(task = %result.task().label()))]
    pub async fn insert_task(&self, run_id: i64, result: &TaskResult) -> Result<i64, StoreError> {
        let task_id = sqlx::query(
            r#"
            INSERT INTO tasks (
                run_id, site_name, plugin_slug, status, from_version, to_version,
                backup_path, http_code, maintenance_cleared, error_message,
                stdout, stderr, duration_ms, started_at, ended_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run_id)
        .bind(result.task().site().name())
        .bind(result.task().plugin().slug())
        .bind(result.status().as_str())
        .bind(result.from_version())
        .bind(result.to_version())
        .bind(result.backup_path())
        .bind(result.http_code())
        .bind(result.maintenance_cleared())
        .bind(result.error_message())
        .bind(result.stdout())
        .bind(result.stderr())
        .bind(*result.duration_ms() as i64)
        .bind(result.started_at_rfc3339())
        .bind(result.ended_at_rfc3339())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(task_id)
    }

    /// Finalize the counters of `run_id`.
    #[tracing::instrument(skip(self))]
    pub async fn close_run(&self, run_id: i64, stats: &RunStats) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE runs
            SET ended_at = ?, total_tasks = ?, tasks_ok = ?, tasks_needs_attention = ?, tasks_failed = ?
            WHERE run_id = ?
            "#,
        )
        .bind(now_rfc3339())
        .bind(stats.total as i64)
        .bind(stats.ok as i64)
        .bind(stats.needs_attention as i64)
        .bind(stats.failed as i64)
        .bind(run_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(StoreError::RunNotFound(run_id));
        }
        info!(
            "run {} closed: total={} ok={} needs_attention={} failed={}",
            run_id, stats.total, stats.ok, stats.needs_attention, stats.failed
        );
        Ok(())
    }

    pub async fn last_run_id(&self) -> Result<Option<i64>, StoreError> {
        let run_id: Option<i64> = sqlx::query_scalar("SELECT MAX(run_id) FROM runs")
            .fetch_one(&self.pool)
            .await?;
        Ok(run_id)
    }

    /// Pairs of `run_id` that ended `failed` or `needs_attention`.
    pub async fn failed_pairs(&self, run_id: i64) -> Result<HashSet<TaskKey>, StoreError> {
        let pairs: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT site_name, plugin_slug FROM tasks
            WHERE run_id = ? AND status IN (?, ?)
            "#,
        )
        .bind(run_id)
        .bind(Status::Failed.as_str())
        .bind(Status::NeedsAttention.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(pairs.into_iter().collect())
    }

    /// The most recent runs, newest first.
    pub async fn list_runs(&self, limit: u32) -> Result<Vec<RunRecord>, StoreError> {
        let runs = sqlx::query_as::<_, RunRecord>(
            "SELECT * FROM runs ORDER BY run_id DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(runs)
    }

    pub async fn run(&self, run_id: i64) -> Result<RunRecord, StoreError> {
        sqlx::query_as::<_, RunRecord>("SELECT * FROM runs WHERE run_id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::RunNotFound(run_id))
    }

    /// Every task recorded for `run_id`, in insertion (completion) order.
    pub async fn tasks_for_run(&self, run_id: i64) -> Result<Vec<TaskRecord>, StoreError> {
        let tasks = sqlx::query_as::<_, TaskRecord>(
            "SELECT * FROM tasks WHERE run_id = ? ORDER BY task_id",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(tasks)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl FailureHistory for RunStore {
    async fn last_run_id(&self) -> color_eyre::eyre::Result<Option<i64>> {
        Ok(RunStore::last_run_id(self).await?)
    }

    async fn failed_pairs(&self, run_id: i64) -> color_eyre::eyre::Result<HashSet<TaskKey>> {
        Ok(RunStore::failed_pairs(self, run_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::eyre::Result;

    use super::*;
    use crate::executor::tests::task;
    use crate::executor::{SessionOutput, Stopwatch};

    fn result(site: &str, plugin: &str, status: &str) -> TaskResult {
        TaskResult::from_session(
            task(site, plugin),
            SessionOutput {
                exit_code: Some(0),
                stdout: format!("MARKER from_version=1.0\nMARKER status={status}\n"),
                stderr: String::new(),
            },
            Stopwatch::start(),
        )
    }

    #[tokio::test]
    async fn test_open_creates_state_dir_and_is_idempotent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("state").join("results.sqlite");

        let store = RunStore::open(&path).await?;
        store.create_run("wpfleet run").await?;
        store.close().await;

        let store = RunStore::open(&path).await?;
        assert_eq!(Some(1), store.last_run_id().await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_pairs_cover_failed_and_needs_attention() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = RunStore::open(&dir.path().join("results.sqlite")).await?;
        assert_eq!(None, store.last_run_id().await?);

        let run_id = store.create_run("wpfleet run --sites s.yaml").await?;
        let results = vec![
            result("a", "x", "ok"),
            result("a", "y", "failed"),
            result("b", "x", "needs_attention"),
        ];
        let mut task_ids = vec![];
        for r in &results {
            task_ids.push(store.insert_task(run_id, r).await?);
        }
        assert_eq!(vec![1, 2, 3], task_ids);

        let pairs = store.failed_pairs(run_id).await?;
        assert_eq!(
            HashSet::from([
                ("a".to_string(), "y".to_string()),
                ("b".to_string(), "x".to_string())
            ]),
            pairs
        );
        assert!(store.failed_pairs(run_id + 1).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_close_run_records_counters() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = RunStore::open(&dir.path().join("results.sqlite")).await?;
        let run_id = store.create_run("wpfleet run").await?;
        let results = vec![result("a", "x", "ok"), result("b", "x", "failed")];
        for r in &results {
            store.insert_task(run_id, r).await?;
        }

        let stats = RunStats::from_results(&results);
        store.close_run(run_id, &stats).await?;

        let run = store.run(run_id).await?;
        assert_eq!(Some(2), *run.total_tasks());
        assert_eq!(Some(1), *run.tasks_ok());
        assert_eq!(Some(0), *run.tasks_needs_attention());
        assert_eq!(Some(1), *run.tasks_failed());
        assert!(run.ended_at().is_some());
        assert_eq!("wpfleet run", run.command_args());

        let tasks = store.tasks_for_run(run_id).await?;
        assert_eq!(2, tasks.len());
        assert_eq!("failed", tasks[1].status());
        assert_eq!(Some("1.0".to_string()), *tasks[1].from_version());
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_runs_are_reported() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = RunStore::open(&dir.path().join("results.sqlite")).await?;
        assert!(matches!(store.run(42).await, Err(StoreError::RunNotFound(42))));
        assert!(matches!(
            store.close_run(42, &RunStats::default()).await,
            Err(StoreError::RunNotFound(42))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_list_runs_is_newest_first() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = RunStore::open(&dir.path().join("results.sqlite")).await?;
        for i in 0..3 {
            store.create_run(&format!("run {i}")).await?;
        }
        let runs = store.list_runs(2).await?;
        assert_eq!(vec![3, 2], runs.iter().map(|r| *r.run_id()).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn test_stats_always_add_up() {
        let results = vec![
            result("a", "x", "ok"),
            result("a", "y", "needs_attention"),
            result("b", "x", "failed"),
            result("b", "y", "bogus"),
        ];
        let stats = RunStats::from_results(&results);
        assert_eq!(4, *stats.total());
        assert_eq!(
            *stats.total(),
            stats.ok() + stats.needs_attention() + stats.failed()
        );
        assert_eq!(2, stats.count(Status::Failed));
        assert!(!stats.is_clean());
    }
}
