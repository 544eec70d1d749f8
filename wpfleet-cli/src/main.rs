#![forbid(unsafe_code)]

use std::process::ExitCode;

use clap::{command, Arg, ArgAction};
use color_eyre::eyre::Result;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::util::SubscriberInitExt;


mod commands;

use wpfleet::config;
use wpfleet::log::*;

fn sites_arg() -> Arg {
    Arg::new("sites")
        .help("Path to the sites YAML inventory.")
        .long("sites")
        .required(true)
}

fn plugins_arg() -> Arg {
    Arg::new("plugins")
        .help("Path to the plugins CSV job file.")
        .long("plugins")
        .required(true)
}

fn only_sites_arg() -> Arg {
    Arg::new("only-sites")
        .help("Comma-separated site names to target.")
        .long("only-sites")
}

fn concurrency_arg() -> Arg {
    Arg::new("concurrency")
        .help("Number of tasks in flight at once.")
        .long("concurrency")
        .short('c')
        .default_value("10")
}

fn ssh_opts_arg() -> Arg {
    Arg::new("ssh-opts")
        .help("Extra options passed to ssh and scp, e.g. \"-i ~/.ssh/fleet -o Port=2222\".")
        .long("ssh-opts")
        .env("WPFLEET_SSH_OPTS")
        .allow_hyphen_values(true)
        .default_value("")
}

fn state_dir_arg() -> Arg {
    Arg::new("state-dir")
        .help("Directory holding the run database.")
        .long("state-dir")
        .env("WPFLEET_STATE_DIR")
        .default_value(config::DEFAULT_STATE_DIR)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    install_color_eyre()?;

    // Command configuration
    let matches = command!()
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Turn debugging information on. Overrides -q. Can specify up to -vv.")
                .action(ArgAction::Count)
                .global(true),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .help("Only log errors. Overridden by -v.")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .arg(
            Arg::new("debug")
                .long("debug")
                .help("Enable debug logging. Same as -v.")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .subcommand(
            command!("run")
                .about("Update plugins across the fleet.")
                .arg(sites_arg())
                .arg(plugins_arg())
                .arg(concurrency_arg())
                .arg(
                    Arg::new("dry-run")
                        .help("Print the execution plan without running anything.")
                        .long("dry-run")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("retry-failed")
                        .help("Only retry failed and needs_attention tasks from the last run.")
                        .long("retry-failed")
                        .action(ArgAction::SetTrue),
                )
                .arg(only_sites_arg())
                .arg(
                    Arg::new("only-plugins")
                        .help("Comma-separated plugin slugs to update.")
                        .long("only-plugins"),
                )
                .arg(
                    Arg::new("timeout-sec")
                        .help("Timeout per task phase, in seconds.")
                        .long("timeout-sec")
                        .default_value("900"),
                )
                .arg(
                    Arg::new("report-dir")
                        .help("Directory for CSV and Markdown reports.")
                        .long("report-dir")
                        .env("WPFLEET_REPORT_DIR")
                        .default_value(config::DEFAULT_REPORT_DIR),
                )
                .arg(state_dir_arg())
                .arg(ssh_opts_arg())
                .arg(
                    Arg::new("connect-timeout-sec")
                        .help("ssh ConnectTimeout, in seconds.")
                        .long("connect-timeout-sec")
                        .default_value("30"),
                )
                .arg(
                    Arg::new("remote-script")
                        .help("Stream this script instead of the built-in update script.")
                        .long("remote-script"),
                ),
        )
        .subcommand(
            command!("validate")
                .about("Validate the inventory and job files without connecting anywhere.")
                .arg(sites_arg())
                .arg(plugins_arg()),
        )
        .subcommand(
            command!("check")
                .about("Test ssh connectivity and WordPress on each site.")
                .arg(sites_arg())
                .arg(only_sites_arg())
                .arg(concurrency_arg())
                .arg(ssh_opts_arg()),
        )
        .subcommand(
            command!("history")
                .about("Show recorded runs, or the tasks of one run.")
                .arg(state_dir_arg())
                .arg(
                    Arg::new("limit")
                        .help("How many runs to list.")
                        .long("limit")
                        .default_value("20"),
                )
                .arg(
                    Arg::new("run")
                        .help("Show the tasks of this run id.")
                        .long("run"),
                ),
        )
        .subcommand_required(true)
        .get_matches();

    // Set up logging
    let logging_config = tracing_subscriber::fmt::SubscriberBuilder::default()
        .with_timer(tracing_subscriber::fmt::time::UtcTime::new(
            time::macros::format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
        ))
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::NONE)
        .compact();

    let quiet = matches.get_flag("quiet");
    let verbose = matches.get_count("verbose") as usize + matches.get_flag("debug") as usize;
    let level = if quiet && verbose == 0 {
        LevelFilter::ERROR
    } else {
        match verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let subscriber = logging_config.with_env_filter(filter).finish();
    subscriber.init();

    // Run the commands
    let Some((subcommand, matches)) = matches.subcommand() else {
        return Err(commands::CommandErrors::NoSubcommandProvided.into());
    };
    let ctx = commands::CliContext::new(matches);
    debug!(
        "matched subcommand {} with matches: {:?}",
        &subcommand,
        &matches.ids().map(|id| id.as_str()).collect::<Vec<_>>()
    );
    commands::dispatch(subcommand, &ctx).await
}
