use std::process::ExitCode;
use std::sync::Arc;

use async_trait::async_trait;
use color_eyre::eyre::Result;
use futures::stream::{self, StreamExt};
use wpfleet::executor::ssh::{SshExecutor, PROBE_TIMEOUT};
use wpfleet::log::*;

use super::Arguments;

pub struct CheckCommand;

#[async_trait]
impl<'a> super::Command<'a> for CheckCommand {
    fn new() -> Self
    where
        Self: Sized,
    {
        Self {}
    }

    async fn run(&self, context: &'a super::CliContext) -> Result<ExitCode> {
        let matches = context.matches;
        let mut sites = super::load_sites(&self.read_path(matches, "sites")?)?;
        if let Some(only) = self.read_list(matches, "only-sites") {
            sites.retain(|site| only.contains(site.name()));
        }
        let concurrency = self.read_number::<usize>(matches, "concurrency", 1)?;
        let executor = Arc::new(SshExecutor::new(
            self.read_ssh_config(matches)?,
            PROBE_TIMEOUT,
        )?);

        let total = sites.len();
        println!("* checking {} site(s)", total);
        let outcomes: Vec<_> = stream::iter(sites)
            .map(move |site| {
                let executor = executor.clone();
                async move {
                    let outcome = executor.probe(&site).await;
                    (site, outcome)
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut failed = 0;
        for (site, outcome) in outcomes {
            match outcome {
                Ok(version) => {
                    info!("{}: ok, WordPress {}", site.name(), version);
                    println!("✅ {}: WordPress {}", site.name(), version);
                }
                Err(reason) => {
                    failed += 1;
                    error!("{}: {}", site.name(), reason);
                    println!("❌ {}: {}", site.name(), reason);
                }
            }
        }

        println!(
            "* {} of {} site(s) reachable",
            total - failed,
            total
        );
        Ok(if failed == 0 {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        })
    }
}

impl<'a> super::Arguments<'a> for CheckCommand {}
