use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use color_eyre::eyre::{Context, Result};
use derive_getters::Getters;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_stream::StreamExt;
use tokio_util::codec::{BytesCodec, FramedRead};

use super::{ErrorKind, SessionOutput, Stopwatch, TaskExecutor, TaskResult};
use crate::config::SshConfig;
use crate::log::*;
use crate::plan::site::{Site, SourceType};
use crate::plan::Task;

/// How long a connectivity probe may take end to end.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(15);
const PROBE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// A process that either finished or was killed for running too long.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Finished(SessionOutput),
    TimedOut,
}

/// Drives the system `ssh` and `scp` binaries. One ssh session per task; the
/// update script is streamed over stdin so nothing has to be installed on the
/// remote side beforehand.
#[derive(Getters, Debug, Clone)]
pub struct SshExecutor {
    ssh_binary: PathBuf,
    scp_binary: PathBuf,
    config: SshConfig,
    timeout: Duration,
}

impl SshExecutor {
    /// Resolve the ssh/scp binaries up front so a broken environment fails
    /// before any task is dispatched.
    pub fn new(config: SshConfig, timeout: Duration) -> Result<Self> {
        let ssh_binary = which::which(config.ssh_binary())
            .with_context(|| format!("{} not found", config.ssh_binary().display()))?;
        let scp_binary = which::which(config.scp_binary())
            .with_context(|| format!("{} not found", config.scp_binary().display()))?;
        debug!(
            "ssh executor: using {} and {}",
            ssh_binary.display(),
            scp_binary.display()
        );
        Ok(Self {
            ssh_binary,
            scp_binary,
            config,
            timeout,
        })
    }

    /// Options shared by every ssh and scp invocation: unattended-mode
    /// settings first, then the operator's passthrough options. ssh keeps the
    /// first value it sees for an option, so passthrough cannot re-enable
    /// prompts.
    fn connection_opts(&self, connect_timeout: Duration) -> Vec<String> {
        let mut opts: Vec<String> = vec![
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            "StrictHostKeyChecking=accept-new".into(),
            "-o".into(),
            format!("ConnectTimeout={}", connect_timeout.as_secs().max(1)),
        ];
        opts.extend(self.config.extra_opts().iter().cloned());
        opts
    }

    pub fn ssh_args(&self, site: &Site, remote_command: &str) -> Vec<String> {
        let mut args = self.connection_opts(*self.config.connect_timeout());
        args.push(site.destination());
        args.push(remote_command.into());
        args
    }

    pub fn scp_args(&self, site: &Site, local_path: &Path) -> Vec<String> {
        let mut args = self.connection_opts(*self.config.connect_timeout());
        args.push(local_path.display().to_string());
        args.push(format!(
            "{}:{}",
            site.destination(),
            self.config.staging_path()
        ));
        args
    }

    /// `cd` into the site, export the script's environment and read the
    /// script from stdin.
    pub fn remote_command(&self, task: &Task) -> String {
        let site = task.site();
        let plugin = task.plugin();
        let zip_value = match plugin.source_type() {
            SourceType::Url => plugin.zip_source().as_str(),
            SourceType::File => self.config.staging_path().as_str(),
        };
        let env = [
            ("PLUGIN_SLUG", plugin.slug().as_str()),
            ("ZIP_MODE", plugin.source_type().as_str()),
            ("ZIP_VALUE", zip_value),
            ("ACTIVATE", if *plugin.activate() { "true" } else { "false" }),
            ("SITE_URL", site.url().as_str()),
            ("WP_CLI", site.wp_cli().as_str()),
        ];
        let exports: Vec<String> = env
            .iter()
            .map(|(key, value)| format!("export {key}={};", shell_words::quote(value)))
            .collect();
        format!(
            "cd {} && {} bash -s",
            shell_words::quote(site.path()),
            exports.join(" ")
        )
    }

    /// Copy a local archive to the staging path. Any failure is an
    /// `SCP_FAIL` message.
    #[tracing::instrument(skip(self, task), fields(task = %task.label()))]
    async fn stage_archive(&self, task: &Task) -> Result<(), String> {
        let local_path = Path::new(task.plugin().zip_source());
        if !local_path.is_file() {
            return Err(ErrorKind::ScpFail.message(format!(
                "Local file not found: {}",
                local_path.display()
            )));
        }

        info!(
            "copying plugin archive to {}:{}",
            task.site().name(),
            self.config.staging_path()
        );
        let mut cmd = Command::new(&self.scp_binary);
        cmd.args(self.scp_args(task.site(), local_path));
        match run_process(cmd, None, self.timeout).await {
            Ok(ProcessOutcome::Finished(output)) if output.success() => Ok(()),
            Ok(ProcessOutcome::Finished(output)) => Err(ErrorKind::ScpFail.message(format!(
                "SCP failed: {}",
                output.stderr.trim()
            ))),
            Ok(ProcessOutcome::TimedOut) => Err(ErrorKind::ScpFail.message(format!(
                "SCP timeout after {}s",
                self.timeout.as_secs()
            ))),
            Err(e) => Err(ErrorKind::ScpFail.message(format!("SCP exception: {e}"))),
        }
    }

    /// Run the update script for `task`. Both this and staging get the full
    /// per-task timeout, each measured from its own start.
    #[tracing::instrument(skip(self, task), fields(task = %task.label()))]
    async fn run_script(&self, task: &Task) -> TaskResult {
        let clock = Stopwatch::start();
        info!("executing update: {}", task.label());
        debug!(
            "remote command: cd {} && export PLUGIN_SLUG=... bash -s",
            task.site().path()
        );

        let mut cmd = Command::new(&self.ssh_binary);
        cmd.args(self.ssh_args(task.site(), &self.remote_command(task)));
        let outcome = run_process(cmd, Some(self.config.remote_script()), self.timeout).await;

        match outcome {
            Ok(ProcessOutcome::Finished(output)) => {
                let result = TaskResult::from_session(task.clone(), output, clock);
                info!(
                    "task completed: {} - status: {}, {} -> {}, http: {}, duration: {}ms",
                    task.label(),
                    result.status(),
                    result.from_version(),
                    result.to_version(),
                    result.http_code(),
                    result.duration_ms()
                );
                result
            }
            Ok(ProcessOutcome::TimedOut) => {
                error!("task timeout: {}", task.label());
                TaskResult::failed(
                    task.clone(),
                    ErrorKind::Timeout.message(format!(
                        "Task exceeded timeout ({}s)",
                        self.timeout.as_secs_f64()
                    )),
                    clock,
                )
            }
            Err(e) => {
                error!("task exception: {}: {:?}", task.label(), e);
                TaskResult::unknown_exception(task.clone(), format!("{e:#}"), clock)
            }
        }
    }

    /// Check that a site answers over ssh and has a working WordPress
    /// install. Returns the WordPress version on success and the reason
    /// otherwise.
    #[tracing::instrument(skip(self, site), fields(site = %site.name()))]
    pub async fn probe(&self, site: &Site) -> Result<String, String> {
        let mut args =
            self.connection_opts(Duration::from_secs(PROBE_CONNECT_TIMEOUT_SECS));
        args.extend([
            site.destination(),
            format!(
                "cd {} && {} core version",
                shell_words::quote(site.path()),
                site.wp_cli()
            ),
        ]);
        let mut cmd = Command::new(&self.ssh_binary);
        cmd.args(args);

        match run_process(cmd, None, PROBE_TIMEOUT).await {
            Ok(ProcessOutcome::Finished(output)) if output.success() => {
                Ok(output.stdout.trim().to_string())
            }
            Ok(ProcessOutcome::Finished(output)) => {
                Err(format!("connection failed: {}", output.stderr.trim()))
            }
            Ok(ProcessOutcome::TimedOut) => Err(format!(
                "connection timed out after {} seconds",
                PROBE_TIMEOUT.as_secs()
            )),
            Err(e) => Err(format!("error: {e}")),
        }
    }
}

#[async_trait]
impl TaskExecutor for SshExecutor {
    #[tracing::instrument(skip(self, task), fields(task = %task.label()))]
    async fn execute(&self, task: &Task) -> Result<TaskResult> {
        info!("starting task: {}", task.label());
        if *task.plugin().source_type() == SourceType::File {
            let clock = Stopwatch::start();
            if let Err(message) = self.stage_archive(task).await {
                error!("{}", message);
                return Ok(TaskResult::failed(task.clone(), message, clock));
            }
        }
        Ok(self.run_script(task).await)
    }
}

/// Spawn `cmd`, feed it `stdin`, and collect its output until it exits or
/// `timeout` passes. On timeout the child is killed.
#[tracing::instrument(skip(cmd, stdin))]
pub async fn run_process(
    mut cmd: Command,
    stdin: Option<&str>,
    timeout: Duration,
) -> Result<ProcessOutcome> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

    let program = cmd.as_std().get_program().to_string_lossy().to_string();
    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning command '{}' failed", program))?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        let input = input.to_string();
        tokio::spawn(async move {
            // The remote may exit without reading all of it.
            if let Err(e) = pipe.write_all(input.as_bytes()).await {
                debug!("stdin closed early: {}", e);
            }
        });
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| eyre!("stdout of '{}' was not captured", program))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| eyre!("stderr of '{}' was not captured", program))?;
    let mut stdout = FramedRead::new(stdout, BytesCodec::new());
    let mut stderr = FramedRead::new(stderr, BytesCodec::new());

    let collect = async {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let mut stdout_open = true;
        let mut stderr_open = true;
        while stdout_open || stderr_open {
            tokio::select! {
                next = stdout.next(), if stdout_open => match next {
                    Some(Ok(chunk)) => {
                        trace!("stdout: {}", String::from_utf8_lossy(&chunk));
                        out.extend_from_slice(&chunk);
                    }
                    Some(Err(e)) => {
                        warn!("error reading stdout: {}", e);
                        stdout_open = false;
                    }
                    None => stdout_open = false,
                },
                next = stderr.next(), if stderr_open => match next {
                    Some(Ok(chunk)) => {
                        trace!("stderr: {}", String::from_utf8_lossy(&chunk));
                        err.extend_from_slice(&chunk);
                    }
                    Some(Err(e)) => {
                        warn!("error reading stderr: {}", e);
                        stderr_open = false;
                    }
                    None => stderr_open = false,
                },
            }
        }
        let status = child.wait().await?;
        Ok::<_, std::io::Error>(SessionOutput {
            exit_code: status.code(),
            stdout: String::from_utf8_lossy(&out).into_owned(),
            stderr: String::from_utf8_lossy(&err).into_owned(),
        })
    };

    match tokio::time::timeout(timeout, collect).await {
        Ok(output) => Ok(ProcessOutcome::Finished(output.with_context(|| {
            format!("waiting for command '{}' failed", program)
        })?)),
        Err(_) => Ok(ProcessOutcome::TimedOut),
    }
}
