use std::process::ExitCode;
use std::sync::Arc;

use async_trait::async_trait;
use clap::ArgMatches;
use color_eyre::eyre::Result;
use wpfleet::config::RunConfig;
use wpfleet::coordinator::events::{self, RunEvent};
use wpfleet::executor::ssh::SshExecutor;
use wpfleet::executor::Status;
use wpfleet::log::*;
use wpfleet::plan::Task;
use wpfleet::run::{RunOptions, RunOutcome, RunSummary, Runner};

use super::Arguments;

const RULE: &str = "======================================================================";

pub struct RunCommand;

impl RunCommand {
    fn read_config(&self, matches: &ArgMatches) -> Result<RunConfig> {
        let mut ssh = self
            .read_ssh_config(matches)?
            .with_connect_timeout(self.read_seconds(matches, "connect-timeout-sec")?);
        if let Some(script) = matches.get_one::<String>("remote-script") {
            ssh = ssh.with_remote_script_file(std::path::Path::new(script))?;
        }

        Ok(RunConfig::default()
            .with_concurrency(self.read_number::<usize>(matches, "concurrency", 1)?)
            .with_timeout(self.read_seconds(matches, "timeout-sec")?)
            .with_report_dir(self.read_path(matches, "report-dir")?)
            .with_state_dir(self.read_path(matches, "state-dir")?)
            .with_ssh(ssh))
    }

    fn print_plan(&self, tasks: &[Task], config: &RunConfig) {
        println!("{RULE}");
        println!("DRY RUN - Execution Plan");
        println!("{RULE}");
        for (i, task) in tasks.iter().enumerate() {
            println!(
                "{:3}. {:20} | {:30} | {:5} | {}",
                i + 1,
                task.site().name(),
                task.plugin().slug(),
                task.plugin().source_type().as_str(),
                task.plugin().redacted_source()
            );
        }
        println!("{RULE}");
        println!("Total tasks: {}", tasks.len());
        println!("Concurrency: {}", config.concurrency());
        println!("Timeout: {}s per task", config.timeout().as_secs());
        println!("{RULE}");
        println!("Dry run complete. Use without --dry-run to execute.");
    }

    fn print_summary(&self, summary: &RunSummary) {
        let stats = summary.stats();
        println!("{RULE}");
        if let Some(previous) = summary.retried_from() {
            println!("Run {} (retry of run {}) complete", summary.run_id(), previous);
        } else {
            println!("Run {} complete", summary.run_id());
        }
        println!("{RULE}");
        println!("Total tasks:        {}", stats.total());
        println!("✅ OK:              {}", stats.count(Status::Ok));
        println!("⚠️  Needs attention: {}", stats.count(Status::NeedsAttention));
        println!("❌ Failed:          {}", stats.count(Status::Failed));
        println!("{RULE}");
        println!("Reports:");
        println!("  CSV:      {}", summary.reports().csv().display());
        println!("  Markdown: {}", summary.reports().markdown().display());
        println!("{RULE}");
    }
}

#[async_trait]
impl<'a> super::Command<'a> for RunCommand {
    fn new() -> Self
    where
        Self: Sized,
    {
        Self {}
    }

    async fn run(&self, context: &'a super::CliContext) -> Result<ExitCode> {
        let matches = context.matches;
        let sites = super::load_sites(&self.read_path(matches, "sites")?)?;
        let plugins = super::load_plugins(&self.read_path(matches, "plugins")?)?;
        let config = self.read_config(matches)?;
        let dry_run = matches.get_flag("dry-run");

        let options = RunOptions::new(sites, plugins)
            .with_only_sites(self.read_list(matches, "only-sites"))
            .with_only_plugins(self.read_list(matches, "only-plugins"))
            .with_retry_failed(matches.get_flag("retry-failed"))
            .with_dry_run(dry_run)
            .with_command_line(shell_words::join(std::env::args()));

        let (sink, mut source) = events::channel(1024);
        let printer = tokio::task::spawn(async move {
            while let Some(event) = source.next().await {
                if let RunEvent::TaskFinished {
                    label,
                    completed,
                    total,
                    status,
                    duration_ms,
                    error_message,
                } = event
                {
                    if error_message.is_empty() {
                        println!("[{completed}/{total}] {label}: {status} ({duration_ms}ms)");
                    } else {
                        println!(
                            "[{completed}/{total}] {label}: {status} ({duration_ms}ms) - {error_message}"
                        );
                    }
                }
            }
        });

        let mut runner = Runner::new(config.clone(), Arc::new(sink));
        if !dry_run {
            let executor = SshExecutor::new(config.ssh().clone(), *config.timeout())?;
            runner = runner.with_executor(Arc::new(executor));
        }
        let outcome = runner.run(options).await;
        drop(runner);
        if let Err(e) = printer.await {
            warn!("event printer stopped abnormally: {}", e);
        }

        let outcome = outcome?;
        match &outcome {
            RunOutcome::NoTasks => println!("* no tasks to execute."),
            RunOutcome::DryRun(tasks) => self.print_plan(tasks, &config),
            RunOutcome::Completed(summary) => self.print_summary(summary),
        }
        Ok(ExitCode::from(outcome.exit_code()))
    }
}

impl<'a> super::Arguments<'a> for RunCommand {}
