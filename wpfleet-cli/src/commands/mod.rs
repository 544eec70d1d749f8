use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use clap::ArgMatches;
use color_eyre::eyre::{Context, Result};
use thiserror::Error;
use wpfleet::config::SshConfig;
use wpfleet::log::*;
use wpfleet::plan::inventory;
use wpfleet::plan::site::{Plugin, Site};

pub mod check;
pub mod history;
pub mod run;
pub mod validate;

#[derive(Error, Debug)]
pub enum CommandErrors {
    #[error("Required user input `{0}` is missing.")]
    RequiredUserInputMissing(String),
    #[error("Argument `{0}` failed validation `{1}`")]
    InputValidationFailure(String, String),
    #[error("Invalid subcommand `{0}`.")]
    InvalidSubcommand(String),
    #[error("No subcommand provided.")]
    NoSubcommandProvided,
}

pub struct CliContext<'a> {
    pub matches: &'a ArgMatches,
}

impl<'a> CliContext<'a> {
    pub fn new(matches: &'a ArgMatches) -> Self {
        Self { matches }
    }
}

#[async_trait]
pub trait Command<'a> {
    fn new() -> Self
    where
        Self: Sized;

    async fn run(&self, context: &'a CliContext) -> Result<ExitCode>;
}

pub trait Arguments<'a> {
    /// Read argument from the CLI args with a validation function.
    fn read_argument_with_validator<V>(
        &self,
        arg_matches: &'a ArgMatches,
        id: &'a str,
        validator: &mut V,
    ) -> Result<String>
    where
        V: FnMut(&String) -> Result<(), CommandErrors>,
    {
        if let Some(arg) = arg_matches.get_one::<String>(id) {
            validator(arg)?;
            Ok(arg.clone())
        } else {
            Err(CommandErrors::RequiredUserInputMissing(id.into()))?
        }
    }

    fn read_path(&self, arg_matches: &'a ArgMatches, id: &'a str) -> Result<PathBuf> {
        self.read_argument_with_validator(arg_matches, id, &mut |_| Ok(()))
            .map(PathBuf::from)
    }

    /// Read a number, rejecting anything below `min`.
    fn read_number<T>(&self, arg_matches: &'a ArgMatches, id: &'a str, min: T) -> Result<T>
    where
        T: FromStr + PartialOrd + std::fmt::Display + Copy,
    {
        let raw = self.read_argument_with_validator(arg_matches, id, &mut |input| {
            match input.trim().parse::<T>() {
                Ok(n) if n >= min => Ok(()),
                _ => Err(CommandErrors::InputValidationFailure(
                    id.into(),
                    format!("a number >= {min}"),
                )),
            }
        })?;
        match raw.trim().parse::<T>() {
            Ok(n) => Ok(n),
            Err(_) => Err(CommandErrors::InputValidationFailure(id.into(), "a number".into()))?,
        }
    }

    /// A comma-separated list, or `None` when the flag is absent or blank.
    fn read_list(&self, arg_matches: &'a ArgMatches, id: &'a str) -> Option<Vec<String>> {
        arg_matches
            .get_one::<String>(id)
            .and_then(|raw| wpfleet::plan::parse_list(raw))
    }

    fn read_seconds(&self, arg_matches: &'a ArgMatches, id: &'a str) -> Result<Duration> {
        self.read_number::<u64>(arg_matches, id, 1)
            .map(Duration::from_secs)
    }

    fn read_ssh_config(&self, arg_matches: &'a ArgMatches) -> Result<SshConfig> {
        let opts = arg_matches
            .get_one::<String>("ssh-opts")
            .map(String::as_str)
            .unwrap_or_default();
        SshConfig::default().with_opts_string(opts)
    }
}

/// Run the named subcommand.
pub async fn dispatch(subcommand: &str, context: &CliContext<'_>) -> Result<ExitCode> {
    match subcommand {
        "run" => run::RunCommand::new().run(context).await,
        "validate" => validate::ValidateCommand::new().run(context).await,
        "check" => check::CheckCommand::new().run(context).await,
        "history" => history::HistoryCommand::new().run(context).await,
        _ => Err(CommandErrors::InvalidSubcommand(subcommand.into()).into()),
    }
}

/// Load the inventory, logging what was found.
pub fn load_sites(path: &Path) -> Result<Vec<Site>> {
    info!("loading sites from: {}", path.display());
    let sites = inventory::load_sites(path).context("Failed to load configuration")?;
    info!("loaded {} site(s)", sites.len());
    Ok(sites)
}

/// Load the plugin job, logging what was found.
pub fn load_plugins(path: &Path) -> Result<Vec<Plugin>> {
    info!("loading plugins from: {}", path.display());
    let plugins = inventory::load_plugins(path).context("Failed to load configuration")?;
    info!("loaded {} plugin(s)", plugins.len());
    Ok(plugins)
}
