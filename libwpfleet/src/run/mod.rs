//! One engine invocation: plan the tasks, open a run, dispatch, report, and
//! close the run with its counters.

use std::sync::Arc;

use color_eyre::eyre::Result;
use derive_getters::Getters;
use time::OffsetDateTime;

use crate::config::RunConfig;
use crate::coordinator::events::EventSink;
use crate::coordinator::Coordinator;
use crate::executor::{TaskExecutor, TaskResult};
use crate::log::*;
use crate::plan::site::{Plugin, Site};
use crate::plan::{self, Task};
use crate::report::{self, ReportPaths};
use crate::store::{RunStats, RunStore};

/// What to run. Sites and plugins arrive already loaded and validated.
#[derive(Getters, Debug, Clone, Default)]
pub struct RunOptions {
    sites: Vec<Site>,
    plugins: Vec<Plugin>,
    only_sites: Option<Vec<String>>,
    only_plugins: Option<Vec<String>>,
    retry_failed: bool,
    dry_run: bool,
    command_line: String,
}

impl RunOptions {
    pub fn new(sites: Vec<Site>, plugins: Vec<Plugin>) -> Self {
        Self {
            sites,
            plugins,
            ..Default::default()
        }
    }

    pub fn with_only_sites(mut self, only_sites: Option<Vec<String>>) -> Self {
        self.only_sites = only_sites;
        self
    }

    pub fn with_only_plugins(mut self, only_plugins: Option<Vec<String>>) -> Self {
        self.only_plugins = only_plugins;
        self
    }

    pub fn with_retry_failed(mut self, retry_failed: bool) -> Self {
        self.retry_failed = retry_failed;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// The literal command line recorded with the run.
    pub fn with_command_line<S: Into<String>>(mut self, command_line: S) -> Self {
        self.command_line = command_line.into();
        self
    }
}

#[derive(Getters, Debug, Clone)]
pub struct RunSummary {
    run_id: i64,
    stats: RunStats,
    results: Vec<TaskResult>,
    reports: ReportPaths,
    retried_from: Option<i64>,
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// Filtering or retry selection left nothing to do.
    NoTasks,
    /// The plan that would have run.
    DryRun(Vec<Task>),
    Completed(RunSummary),
}

impl RunOutcome {
    /// 0 when nothing ended `failed` or `needs_attention`, 1 otherwise.
    pub fn exit_code(&self) -> u8 {
        match self {
            RunOutcome::NoTasks | RunOutcome::DryRun(_) => 0,
            RunOutcome::Completed(summary) if summary.stats.is_clean() => 0,
            RunOutcome::Completed(_) => 1,
        }
    }
}

#[derive(Getters, Debug, Clone)]
pub struct Runner {
    config: RunConfig,
    #[getter(skip)]
    executor: Option<Arc<dyn TaskExecutor>>,
    #[getter(skip)]
    events: Arc<dyn EventSink>,
}

impl Runner {
    pub fn new(config: RunConfig, events: Arc<dyn EventSink>) -> Self {
        Self {
            config,
            executor: None,
            events,
        }
    }

    /// The executor tasks are handed to. Only needed when tasks actually
    /// run, so planning and dry runs work without one.
    pub fn with_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Plan the tasks of `options`, selecting retries from the store when
    /// asked to. The store is only opened when it is needed.
    #[tracing::instrument(skip_all)]
    async fn plan(
        &self,
        options: &RunOptions,
    ) -> Result<(Vec<Task>, Option<RunStore>, Option<i64>)> {
        let mut tasks = plan::expand(options.sites(), options.plugins());
        info!("expanded to {} total task(s)", tasks.len());

        if options.only_sites.is_some() || options.only_plugins.is_some() {
            tasks = plan::filter(
                tasks,
                options.only_sites.as_deref(),
                options.only_plugins.as_deref(),
            );
            info!("filtered to {} task(s)", tasks.len());
        }

        if !options.retry_failed {
            return Ok((tasks, None, None));
        }

        let store = RunStore::open(&self.config.database_path()).await?;
        let (last_run_id, tasks) = plan::select_retry(tasks, &store).await?;
        info!("retrying {} task(s)", tasks.len());
        Ok((tasks, Some(store), Some(last_run_id)))
    }

    #[tracing::instrument(skip_all)]
    pub async fn run(&self, options: RunOptions) -> Result<RunOutcome> {
        let (tasks, store, retried_from) = self.plan(&options).await?;

        if tasks.is_empty() {
            warn!("no tasks to execute");
            return Ok(RunOutcome::NoTasks);
        }
        if options.dry_run {
            return Ok(RunOutcome::DryRun(tasks));
        }

        let executor = self
            .executor
            .clone()
            .ok_or_else(|| eyre!("no task executor configured"))?;
        let store = match store {
            Some(store) => store,
            None => RunStore::open(&self.config.database_path()).await?,
        };
        let run_id = store.create_run(&options.command_line).await?;
        info!(
            "executing {} task(s) with concurrency {}",
            tasks.len(),
            self.config.concurrency()
        );

        let coordinator =
            Coordinator::new(*self.config.concurrency(), executor, self.events.clone());
        let results = coordinator.dispatch(run_id, tasks, &store).await;
        let completed_at = OffsetDateTime::now_utc();
        let stats = RunStats::from_results(&results);

        let reports =
            report::write_reports(self.config.report_dir(), run_id, &results, completed_at).await;
        store.close_run(run_id, &stats).await?;
        store.close().await;
        let reports = reports?;

        Ok(RunOutcome::Completed(RunSummary {
            run_id,
            stats,
            results,
            reports,
            retried_from,
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::path::Path;

    use color_eyre::eyre::Result;

    use super::*;
    use crate::coordinator::events::TracingEventSink;
    use crate::coordinator::tests::ScriptedExecutor;
    use crate::executor::Status;
    use crate::plan::site::SourceType;
    use crate::plan::{PlanError, TaskKey};

    fn sites(names: &[&str]) -> Vec<Site> {
        names
            .iter()
            .map(|n| Site::new(*n, "192.0.2.50", "deploy", "/srv/www", "https://example.net"))
            .collect()
    }

    fn plugins(slugs: &[&str]) -> Vec<Plugin> {
        slugs
            .iter()
            .map(|s| Plugin::new(*s, "https://vendor.example.net/p.zip?token=abc", SourceType::Url))
            .collect()
    }

    fn runner(root: &Path, concurrency: usize) -> Runner {
        let config = RunConfig::default()
            .with_concurrency(concurrency)
            .with_state_dir(root.join("state"))
            .with_report_dir(root.join("reports"));
        Runner::new(config, Arc::new(TracingEventSink))
            .with_executor(Arc::new(ScriptedExecutor::default()))
    }

    fn completed(outcome: RunOutcome) -> RunSummary {
        match outcome {
            RunOutcome::Completed(summary) => summary,
            other => panic!("expected a completed run, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_two_sites_one_plugin_end_to_end() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let runner = runner(dir.path(), 1);
        let options = RunOptions::new(sites(&["ok-a", "ok-b"]), plugins(&["acf"]))
            .with_command_line("wpfleet run --sites s.yaml --plugins p.csv");

        let outcome = runner.run(options).await?;
        assert_eq!(0, outcome.exit_code());
        let summary = completed(outcome);
        assert_eq!(2, *summary.stats().total());
        assert_eq!(2, summary.results().len());

        let md = std::fs::read_to_string(summary.reports().markdown())?;
        assert_eq!(1, md.matches("### ✅ OK").count());
        assert!(!md.contains("### ❌ FAILED"));
        assert!(summary.reports().csv().exists());

        let store = RunStore::open(&runner.config().database_path()).await?;
        let run = store.run(*summary.run_id()).await?;
        assert_eq!(Some(2), *run.total_tasks());
        assert_eq!("wpfleet run --sites s.yaml --plugins p.csv", run.command_args());
        Ok(())
    }

    #[tokio::test]
    async fn test_retry_selects_only_previous_failures() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let runner = runner(dir.path(), 3);
        let site_names = ["ok-a", "failed-b", "ok-c", "needs_attention-d", "ok-e"];

        let first = runner
            .run(RunOptions::new(sites(&site_names), plugins(&["acf"])))
            .await?;
        assert_eq!(1, first.exit_code());
        let first = completed(first);
        assert_eq!(3, *first.stats().ok());
        assert_eq!(
            *first.stats().total(),
            first.stats().ok() + first.stats().needs_attention() + first.stats().failed()
        );

        // Job order reversed on the retry.
        let mut reversed = site_names.to_vec();
        reversed.reverse();
        let retry = runner
            .run(
                RunOptions::new(sites(&reversed), plugins(&["acf"]))
                    .with_retry_failed(true)
                    .with_dry_run(true),
            )
            .await?;
        let planned: HashSet<TaskKey> = match retry {
            RunOutcome::DryRun(tasks) => tasks.iter().map(Task::key).collect(),
            other => panic!("expected a dry run, got {other:?}"),
        };
        assert_eq!(
            HashSet::from([
                ("failed-b".to_string(), "acf".to_string()),
                ("needs_attention-d".to_string(), "acf".to_string()),
            ]),
            planned
        );

        let retry = completed(
            runner
                .run(RunOptions::new(sites(&reversed), plugins(&["acf"])).with_retry_failed(true))
                .await?,
        );
        assert_eq!(Some(*first.run_id()), *retry.retried_from());
        assert_eq!(2, *retry.stats().total());
        assert!(retry
            .results()
            .iter()
            .all(|r| *r.status() != Status::Ok));
        Ok(())
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_runs_can_be_spawned() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let runner = runner(dir.path(), 2);
        let options = RunOptions::new(sites(&["ok-a", "failed-b"]), plugins(&["acf"]));

        let pending = runner.run(options.clone());
        assert_send(&pending);
        drop(pending);

        let first = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run(options).await }).await??
        };
        assert_eq!(1, first.exit_code());

        let retry = RunOptions::new(sites(&["ok-a", "failed-b"]), plugins(&["acf"]))
            .with_retry_failed(true);
        let retry = completed(tokio::spawn(async move { runner.run(retry).await }).await??);
        assert_eq!(1, *retry.stats().total());
        Ok(())
    }

    #[tokio::test]
    async fn test_back_to_back_runs_keep_separate_reports() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let runner = runner(dir.path(), 1);
        let first = completed(
            runner
                .run(RunOptions::new(sites(&["ok-a"]), plugins(&["acf"])))
                .await?,
        );
        let second = completed(
            runner
                .run(RunOptions::new(sites(&["failed-b"]), plugins(&["acf"])))
                .await?,
        );

        assert_ne!(first.reports(), second.reports());
        let md = std::fs::read_to_string(first.reports().markdown())?;
        assert!(md.contains(&format!("**Run ID:** {}\n", first.run_id())));
        assert!(!md.contains("### ❌ FAILED"));
        Ok(())
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let runner = runner(dir.path(), 1);
        let outcome = runner
            .run(RunOptions::new(sites(&["ok-a", "ok-b"]), plugins(&["acf"])).with_dry_run(true))
            .await?;

        assert_eq!(0, outcome.exit_code());
        match outcome {
            RunOutcome::DryRun(tasks) => assert_eq!(2, tasks.len()),
            other => panic!("expected a dry run, got {other:?}"),
        }
        assert!(!runner.config().database_path().exists());
        assert!(!runner.config().report_dir().exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_dry_run_needs_no_executor() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = RunConfig::default().with_state_dir(dir.path());
        let runner = Runner::new(config, Arc::new(TracingEventSink));
        let options = RunOptions::new(sites(&["ok-a"]), plugins(&["acf"]));

        assert!(runner.run(options.clone().with_dry_run(true)).await.is_ok());
        assert!(runner.run(options).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_retry_without_history_is_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let err = runner(dir.path(), 1)
            .run(RunOptions::new(sites(&["ok-a"]), plugins(&["acf"])).with_retry_failed(true))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PlanError>(),
            Some(PlanError::NoPriorRun)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_selection_is_not_a_failure() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let runner = runner(dir.path(), 1);
        let outcome = runner
            .run(
                RunOptions::new(sites(&["ok-a"]), plugins(&["acf"]))
                    .with_only_sites(Some(vec!["elsewhere".into()])),
            )
            .await?;
        assert!(matches!(outcome, RunOutcome::NoTasks));
        assert_eq!(0, outcome.exit_code());
        assert!(!runner.config().database_path().exists());
        Ok(())
    }
}
