use std::collections::HashSet;

use async_trait::async_trait;
use color_eyre::eyre::Result;
use derive_getters::Getters;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::log::*;

pub mod inventory;
pub mod site;

use self::site::{Plugin, Site};

/// A `(site name, plugin slug)` pair, the identity of a task across runs.
pub type TaskKey = (String, String);

#[derive(Error, Debug)]
pub enum PlanError {
    #[error("no previous run found for --retry-failed")]
    NoPriorRun,
}

/// One plugin update on one site. Tasks share no mutable state and have no
/// ordering dependency on each other, so any number may run in parallel.
#[derive(Getters, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    site: Site,
    plugin: Plugin,
    run_id: Option<i64>,
    task_id: Option<i64>,
}

impl Task {
    pub fn new(site: Site, plugin: Plugin) -> Self {
        Self {
            site,
            plugin,
            run_id: None,
            task_id: None,
        }
    }

    /// Record where this task was persisted.
    pub fn persisted_as(mut self, run_id: i64, task_id: i64) -> Self {
        self.run_id = Some(run_id);
        self.task_id = Some(task_id);
        self
    }

    pub fn key(&self) -> TaskKey {
        (self.site.name().clone(), self.plugin.slug().clone())
    }

    /// `site/plugin`, for log lines.
    pub fn label(&self) -> String {
        format!("{}/{}", self.site.name(), self.plugin.slug())
    }
}

/// Pair every site with every plugin, sites in the outer loop. Dry-run and
/// report ordering rely on this order.
#[tracing::instrument(skip_all, fields(sites = sites.len(), plugins = plugins.len()))]
pub fn expand(sites: &[Site], plugins: &[Plugin]) -> Vec<Task> {
    let tasks: Vec<Task> = sites
        .iter()
        .flat_map(|site| {
            plugins
                .iter()
                .map(move |plugin| Task::new(site.clone(), plugin.clone()))
        })
        .collect();
    debug!("plan: expanded to {} task(s)", tasks.len());
    tasks
}

/// Keep tasks whose site is in `only_sites` and whose plugin is in
/// `only_plugins`. An absent filter leaves its dimension unconstrained.
pub fn filter(
    tasks: Vec<Task>,
    only_sites: Option<&[String]>,
    only_plugins: Option<&[String]>,
) -> Vec<Task> {
    let sites: Option<HashSet<&str>> = only_sites.map(|s| s.iter().map(String::as_str).collect());
    let plugins: Option<HashSet<&str>> =
        only_plugins.map(|p| p.iter().map(String::as_str).collect());

    tasks
        .into_iter()
        .filter(|task| {
            sites
                .as_ref()
                .map_or(true, |s| s.contains(task.site().name().as_str()))
                && plugins
                    .as_ref()
                    .map_or(true, |p| p.contains(task.plugin().slug().as_str()))
        })
        .collect()
}

/// Read access to the outcomes of earlier runs.
#[async_trait]
pub trait FailureHistory: Send + Sync {
    async fn last_run_id(&self) -> Result<Option<i64>>;

    /// Pairs that ended `failed` or `needs_attention` in `run_id`.
    async fn failed_pairs(&self, run_id: i64) -> Result<HashSet<TaskKey>>;
}

/// Narrow `tasks` to the pairs that failed or needed attention in the most
/// recent run. Returns that run's id with the selection.
#[tracing::instrument(skip_all)]
pub async fn select_retry<H>(tasks: Vec<Task>, history: &H) -> Result<(i64, Vec<Task>)>
where
    H: FailureHistory + ?Sized,
{
    let last_run_id = history.last_run_id().await?.ok_or(PlanError::NoPriorRun)?;
    let failed = history.failed_pairs(last_run_id).await?;
    info!("retrying failed tasks from run {}", last_run_id);

    let tasks: Vec<Task> = tasks
        .into_iter()
        .filter(|task| failed.contains(&task.key()))
        .collect();
    debug!("plan: {} task(s) selected for retry", tasks.len());
    Ok((last_run_id, tasks))
}

/// Split a comma-separated CLI filter, dropping blanks. A filter with no
/// names left is no filter at all.
pub fn parse_list(raw: &str) -> Option<Vec<String>> {
    let names: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    (!names.is_empty()).then_some(names)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use color_eyre::eyre::Result;

    use super::site::SourceType;
    use super::*;

    fn sites(names: &[&str]) -> Vec<Site> {
        names
            .iter()
            .map(|n| {
                Site::new(
                    *n,
                    "198.51.100.7",
                    "deploy",
                    "/var/www/html",
                    "https://example.com",
                )
            })
            .collect()
    }

    fn plugins(slugs: &[&str]) -> Vec<Plugin> {
        slugs
            .iter()
            .map(|s| Plugin::new(*s, "https://vendor.example.com/p.zip", SourceType::Url))
            .collect()
    }

    fn keys(tasks: &[Task]) -> Vec<(String, String)> {
        tasks.iter().map(Task::key).collect()
    }

    struct FixedHistory {
        last: Option<i64>,
        failed: HashMap<i64, HashSet<TaskKey>>,
    }

    #[async_trait]
    impl FailureHistory for FixedHistory {
        async fn last_run_id(&self) -> Result<Option<i64>> {
            Ok(self.last)
        }

        async fn failed_pairs(&self, run_id: i64) -> Result<HashSet<TaskKey>> {
            Ok(self.failed.get(&run_id).cloned().unwrap_or_default())
        }
    }

    fn key(site: &str, plugin: &str) -> TaskKey {
        (site.to_string(), plugin.to_string())
    }

    #[test]
    fn test_expand_is_sites_outer_plugins_inner() {
        let tasks = expand(&sites(&["a", "b", "c"]), &plugins(&["x", "y"]));
        assert_eq!(6, tasks.len());
        assert_eq!(
            vec![
                key("a", "x"),
                key("a", "y"),
                key("b", "x"),
                key("b", "y"),
                key("c", "x"),
                key("c", "y"),
            ],
            keys(&tasks)
        );
        assert!(tasks.iter().all(|t| t.run_id().is_none() && t.task_id().is_none()));
    }

    #[test]
    fn test_expand_with_no_plugins_is_empty() {
        assert!(expand(&sites(&["a"]), &[]).is_empty());
    }

    #[test]
    fn test_filter_without_filters_is_identity() {
        let tasks = expand(&sites(&["a", "b"]), &plugins(&["x", "y"]));
        assert_eq!(tasks, filter(tasks.clone(), None, None));
    }

    #[test]
    fn test_filters_apply_conjunctively() {
        let tasks = expand(&sites(&["a", "b", "c"]), &plugins(&["x", "y"]));
        let only_sites = vec!["a".to_string(), "c".to_string()];
        let only_plugins = vec!["y".to_string()];

        let by_site = filter(tasks.clone(), Some(only_sites.as_slice()), None);
        assert_eq!(4, by_site.len());

        let both = filter(
            tasks,
            Some(only_sites.as_slice()),
            Some(only_plugins.as_slice()),
        );
        assert_eq!(vec![key("a", "y"), key("c", "y")], keys(&both));
    }

    #[test]
    fn test_unknown_filter_values_select_nothing() {
        let tasks = expand(&sites(&["a"]), &plugins(&["x"]));
        let only_sites = vec!["zzz".to_string()];
        assert!(filter(tasks, Some(only_sites.as_slice()), None).is_empty());
    }

    #[tokio::test]
    async fn test_retry_selects_failed_pairs_regardless_of_job_order() -> Result<()> {
        let history = FixedHistory {
            last: Some(7),
            failed: HashMap::from([(7, HashSet::from([key("b", "x"), key("a", "y")]))]),
        };
        // Job file order reversed relative to the run that failed.
        let tasks = expand(&sites(&["a", "b", "c"]), &plugins(&["y", "x"]));

        let (run_id, selected) = select_retry(tasks, &history).await?;
        assert_eq!(7, run_id);
        let selected: HashSet<TaskKey> = selected.iter().map(Task::key).collect();
        assert_eq!(HashSet::from([key("b", "x"), key("a", "y")]), selected);
        Ok(())
    }

    #[tokio::test]
    async fn test_retry_without_history_fails() {
        let history = FixedHistory {
            last: None,
            failed: HashMap::new(),
        };
        let err = select_retry(expand(&sites(&["a"]), &plugins(&["x"])), &history)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PlanError>(),
            Some(PlanError::NoPriorRun)
        ));
    }

    #[test]
    fn test_parse_list() {
        assert_eq!(Some(vec!["a".to_string(), "b".to_string()]), parse_list(" a, ,b,"));
        assert_eq!(None, parse_list(""));
        assert_eq!(None, parse_list(" , "));
    }

    #[test]
    fn test_blank_filter_leaves_dimension_unconstrained() {
        let tasks = expand(&sites(&["a", "b"]), &plugins(&["x", "y"]));
        let only_sites = parse_list("");
        let only_plugins = parse_list("y");
        let filtered = filter(tasks, only_sites.as_deref(), only_plugins.as_deref());
        let labels: Vec<String> = filtered.iter().map(Task::label).collect();
        assert_eq!(vec!["a/y", "b/y"], labels);
    }
}
