//! Explicit configuration handed to each component at construction time.

use std::path::{Path, PathBuf};
use std::time::Duration;

use color_eyre::eyre::{Context, Result};
use derive_getters::Getters;

pub const DEFAULT_CONCURRENCY: usize = 10;
pub const DEFAULT_TIMEOUT_SECS: u64 = 900;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_REPORT_DIR: &str = "reports";
pub const DEFAULT_STATE_DIR: &str = "state";
pub const DB_FILE: &str = "results.sqlite";
pub const DEFAULT_STAGING_PATH: &str = "/tmp/plugin.zip";

/// The script streamed into every remote session unless overridden.
pub const REMOTE_UPDATE_SCRIPT: &str = include_str!("../scripts/remote-update.sh");

/// Settings for one engine invocation.
#[derive(Getters, Debug, Clone)]
pub struct RunConfig {
    concurrency: usize,
    timeout: Duration,
    report_dir: PathBuf,
    state_dir: PathBuf,
    ssh: SshConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            report_dir: PathBuf::from(DEFAULT_REPORT_DIR),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            ssh: SshConfig::default(),
        }
    }
}

impl RunConfig {
    /// Width of the worker pool. Values below one are raised to one.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_report_dir<P: Into<PathBuf>>(mut self, report_dir: P) -> Self {
        self.report_dir = report_dir.into();
        self
    }

    pub fn with_state_dir<P: Into<PathBuf>>(mut self, state_dir: P) -> Self {
        self.state_dir = state_dir.into();
        self
    }

    pub fn with_ssh(mut self, ssh: SshConfig) -> Self {
        self.ssh = ssh;
        self
    }

    /// Location of the run database inside the state directory.
    pub fn database_path(&self) -> PathBuf {
        self.state_dir.join(DB_FILE)
    }
}

/// How remote sessions are opened. The transport itself is the system's
/// `ssh`/`scp` binaries; this only shapes their invocation.
#[derive(Getters, Debug, Clone)]
pub struct SshConfig {
    ssh_binary: PathBuf,
    scp_binary: PathBuf,
    extra_opts: Vec<String>,
    connect_timeout: Duration,
    staging_path: String,
    #[getter(skip)]
    remote_script: String,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            ssh_binary: PathBuf::from("ssh"),
            scp_binary: PathBuf::from("scp"),
            extra_opts: vec![],
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            staging_path: DEFAULT_STAGING_PATH.into(),
            remote_script: REMOTE_UPDATE_SCRIPT.into(),
        }
    }
}

impl SshConfig {
    /// Parse raw passthrough options (e.g. `-i ~/.ssh/key -o Port=2222`)
    /// using shell quoting rules.
    pub fn with_opts_string(mut self, opts: &str) -> Result<Self> {
        self.extra_opts = shell_words::split(opts)
            .with_context(|| format!("invalid ssh options: {opts}"))?;
        Ok(self)
    }

    pub fn with_extra_opts(mut self, opts: Vec<String>) -> Self {
        self.extra_opts = opts;
        self
    }

    pub fn with_binaries<P: Into<PathBuf>>(mut self, ssh: P, scp: P) -> Self {
        self.ssh_binary = ssh.into();
        self.scp_binary = scp.into();
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_staging_path<S: Into<String>>(mut self, staging_path: S) -> Self {
        self.staging_path = staging_path.into();
        self
    }

    pub fn with_remote_script<S: Into<String>>(mut self, script: S) -> Self {
        self.remote_script = script.into();
        self
    }

    /// Replace the embedded remote script with the contents of `path`.
    pub fn with_remote_script_file(self, path: &Path) -> Result<Self> {
        let script = std::fs::read_to_string(path)
            .with_context(|| format!("remote script not found: {}", path.display()))?;
        Ok(self.with_remote_script(script))
    }

    pub fn remote_script(&self) -> &str {
        &self.remote_script
    }
}
