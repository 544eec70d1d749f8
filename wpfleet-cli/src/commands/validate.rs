use std::collections::BTreeMap;
use std::process::ExitCode;

use async_trait::async_trait;
use color_eyre::eyre::Result;
use wpfleet::log::*;
use wpfleet::plan::inventory::duplicate_site_names;
use wpfleet::plan::site::Site;
use wpfleet::plan;

use super::Arguments;

pub struct ValidateCommand;

impl ValidateCommand {
    fn inspect_hosts(&self, sites: &[Site]) {
        let mut by_host: BTreeMap<&str, Vec<&Site>> = BTreeMap::new();
        for site in sites {
            by_host.entry(site.host().as_str()).or_default().push(site);
        }

        println!("** hosts:");
        for (host, sites) in by_host {
            println!("*** host: {}", host);
            for site in sites {
                println!(
                    "**** {}: {} ({}, {})",
                    site.name(),
                    site.destination(),
                    site.path(),
                    site.url()
                );
            }
        }
    }
}

#[async_trait]
impl<'a> super::Command<'a> for ValidateCommand {
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

        info!("job is valid.");
        println!("* job is valid.");
        self.inspect_hosts(&sites);

        let duplicates = duplicate_site_names(&sites);
        for name in &duplicates {
            warn!("duplicate site name: {}", name);
            println!("! duplicate site name: {}", name);
        }

        println!("** plugins:");
        for plugin in &plugins {
            println!(
                "*** {} ({}, activate: {}): {}",
                plugin.slug(),
                plugin.source_type(),
                plugin.activate(),
                plugin.redacted_source()
            );
        }

        let tasks = plan::expand(&sites, &plugins);
        println!(
            "* {} site(s) x {} plugin(s) = {} task(s)",
            sites.len(),
            plugins.len(),
            tasks.len()
        );
        Ok(ExitCode::SUCCESS)
    }
}

impl<'a> super::Arguments<'a> for ValidateCommand {}
