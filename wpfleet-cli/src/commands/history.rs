use std::process::ExitCode;

use async_trait::async_trait;
use color_eyre::eyre::Result;
use wpfleet::config::DB_FILE;
use wpfleet::log::*;
use wpfleet::store::{RunRecord, RunStore};

use super::Arguments;

pub struct HistoryCommand;

fn count(value: &Option<i64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".into())
}

impl HistoryCommand {
    fn print_run(&self, run: &RunRecord) {
        println!(
            "{:>5}  {:25}  total {:>4}  ok {:>4}  attention {:>4}  failed {:>4}  {}",
            run.run_id(),
            run.started_at(),
            count(run.total_tasks()),
            count(run.tasks_ok()),
            count(run.tasks_needs_attention()),
            count(run.tasks_failed()),
            run.command_args()
        );
    }

    async fn show_run(&self, store: &RunStore, run_id: i64) -> Result<()> {
        let run = store.run(run_id).await?;
        self.print_run(&run);
        println!();
        for task in store.tasks_for_run(run_id).await? {
            let none = String::from("none");
            println!(
                "  {:20} {:30} {:16} {} -> {}  {}",
                task.site_name(),
                task.plugin_slug(),
                task.status(),
                task.from_version().as_ref().unwrap_or(&none),
                task.to_version().as_ref().unwrap_or(&none),
                task.error_message().as_deref().unwrap_or_default()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl<'a> super::Command<'a> for HistoryCommand {
    fn new() -> Self
    where
        Self: Sized,
    {
        Self {}
    }

    async fn run(&self, context: &'a super::CliContext) -> Result<ExitCode> {
        let matches = context.matches;
        let path = self.read_path(matches, "state-dir")?.join(DB_FILE);
        if !path.is_file() {
            info!("no run database at {}", path.display());
            println!("* no runs recorded yet.");
            return Ok(ExitCode::SUCCESS);
        }
        let store = RunStore::open(&path).await?;

        if matches.get_one::<String>("run").is_some() {
            let run_id = self.read_number::<i64>(matches, "run", 1)?;
            self.show_run(&store, run_id).await?;
        } else {
            let limit = self.read_number::<u32>(matches, "limit", 1)?;
            let runs = store.list_runs(limit).await?;
            if runs.is_empty() {
                println!("* no runs recorded yet.");
            }
            for run in &runs {
                self.print_run(run);
            }
        }
        store.close().await;
        Ok(ExitCode::SUCCESS)
    }
}

impl<'a> super::Arguments<'a> for HistoryCommand {}
