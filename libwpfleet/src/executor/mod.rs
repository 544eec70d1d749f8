use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use color_eyre::eyre::Result;
use derive_getters::Getters;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::plan::Task;
use crate::protocol::{self, Markers};

pub mod ssh;

pub const NONE_SENTINEL: &str = "none";

/// Runs one [`Task`] to completion. Failures on the remote side are part of
/// the returned [`TaskResult`]; an `Err` means something unanticipated broke
/// and the caller records it as [`ErrorKind::UnknownException`].
#[async_trait]
pub trait TaskExecutor: std::fmt::Debug + Send + Sync {
    async fn execute(&self, task: &Task) -> Result<TaskResult>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    NeedsAttention,
    Failed,
}

impl Status {
    /// Report ordering: problems first.
    pub const PRIORITY: [Status; 3] = [Status::Failed, Status::NeedsAttention, Status::Ok];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::NeedsAttention => "needs_attention",
            Status::Failed => "failed",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(Status::Ok),
            "needs_attention" => Ok(Status::NeedsAttention),
            "failed" => Ok(Status::Failed),
            other => Err(other.to_string()),
        }
    }
}

/// Triage labels prefixed onto `error_message`. They are advisory text for
/// humans reading reports, nothing branches on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    SshConnectFail,
    ScpFail,
    WpNotInstalled,
    ZipFetchFail,
    PluginInstallFail,
    MaintenanceStuck,
    HttpUnhealthy,
    Timeout,
    UnknownStatus,
    UnknownException,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SshConnectFail => "SSH_CONNECT_FAIL",
            ErrorKind::ScpFail => "SCP_FAIL",
            ErrorKind::WpNotInstalled => "WP_NOT_INSTALLED",
            ErrorKind::ZipFetchFail => "ZIP_FETCH_FAIL",
            ErrorKind::PluginInstallFail => "PLUGIN_INSTALL_FAIL",
            ErrorKind::MaintenanceStuck => "MAINTENANCE_STUCK",
            ErrorKind::HttpUnhealthy => "HTTP_UNHEALTHY",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::UnknownStatus => "UNKNOWN_STATUS",
            ErrorKind::UnknownException => "UNKNOWN_EXCEPTION",
        }
    }

    pub fn message<S: fmt::Display>(&self, detail: S) -> String {
        format!("{}: {}", self.as_str(), detail)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a finished remote process left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl SessionOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Wall-clock bounds of one task, captured with both a monotonic and a UTC
/// clock.
#[derive(Debug, Clone, Copy)]
pub struct Stopwatch {
    started_at: OffsetDateTime,
    started: Instant,
}

impl Stopwatch {
    pub fn start() -> Self {
        Self {
            started_at: OffsetDateTime::now_utc(),
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// The outcome of one task. Built once, persisted once, never changed
/// afterwards apart from recording the ids it was persisted under.
#[derive(Getters, Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    task: Task,
    status: Status,
    from_version: String,
    to_version: String,
    backup_path: String,
    http_code: String,
    maintenance_cleared: String,
    error_message: String,
    stdout: String,
    stderr: String,
    duration_ms: u64,
    started_at: OffsetDateTime,
    ended_at: OffsetDateTime,
}

impl TaskResult {
    /// A failed result with every field defaulted.
    pub fn failed<S: Into<String>>(task: Task, error_message: S, clock: Stopwatch) -> Self {
        let duration = clock.elapsed();
        Self {
            task,
            status: Status::Failed,
            from_version: NONE_SENTINEL.into(),
            to_version: NONE_SENTINEL.into(),
            backup_path: NONE_SENTINEL.into(),
            http_code: "0".into(),
            maintenance_cleared: "false".into(),
            error_message: error_message.into(),
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: duration.as_millis() as u64,
            started_at: clock.started_at,
            ended_at: clock.started_at + duration,
        }
    }

    pub fn unknown_exception<S: fmt::Display>(task: Task, detail: S, clock: Stopwatch) -> Self {
        Self::failed(task, ErrorKind::UnknownException.message(detail), clock)
    }

    /// Interpret a finished remote session. Marker values win; missing ones
    /// fall back to their defaults, and a missing `status` is `failed`. When
    /// the session exited non-zero without claiming success, the error is
    /// classified from the captured output.
    pub fn from_session(task: Task, output: SessionOutput, clock: Stopwatch) -> Self {
        let mut markers: Markers = protocol::parse_markers(&output.stdout);
        let mut result = Self::failed(task, String::new(), clock);
        let mut take = |key: &str, default: &str| {
            markers
                .remove(key)
                .unwrap_or_else(|| default.to_string())
        };

        result.from_version = take(protocol::KEY_FROM_VERSION, NONE_SENTINEL);
        result.to_version = take(protocol::KEY_TO_VERSION, NONE_SENTINEL);
        result.backup_path = take(protocol::KEY_BACKUP_PATH, NONE_SENTINEL);
        result.http_code = take(protocol::KEY_HTTP_CODE, "0");
        result.maintenance_cleared = take(protocol::KEY_MAINTENANCE_CLEARED, "false");
        result.error_message = take(protocol::KEY_ERROR, "");
        let status = markers.remove(protocol::KEY_STATUS);

        result.status = match status.as_deref().map(str::parse::<Status>) {
            Some(Ok(status)) => status,
            Some(Err(unknown)) => {
                if result.error_message.is_empty() {
                    result.error_message = ErrorKind::UnknownStatus
                        .message(format!("remote script reported status `{unknown}`"));
                }
                Status::Failed
            }
            None => Status::Failed,
        };

        if !output.success() && result.status == Status::Failed {
            if result.error_message.is_empty() {
                result.error_message = match output.exit_code {
                    Some(code) => format!("SSH command exited with code {code}"),
                    None => "SSH command terminated by signal".to_string(),
                };
            }
            let stderr = output.stderr.to_lowercase();
            if stderr.contains("permission denied") || stderr.contains("connection refused") {
                result.error_message = ErrorKind::SshConnectFail.message(&result.error_message);
            } else if output.stdout.to_lowercase().contains("wp_not_installed") {
                result.error_message = ErrorKind::WpNotInstalled.message(&result.error_message);
            }
        } else if status.is_none() && result.error_message.is_empty() {
            result.error_message = "remote script reported no status".into();
        }

        result.stdout = output.stdout;
        result.stderr = output.stderr;
        result
    }

    /// The result as stored under `run_id`/`task_id`.
    pub fn persisted_as(mut self, run_id: i64, task_id: i64) -> Self {
        self.task = self.task.persisted_as(run_id, task_id);
        self
    }

    pub fn started_at_rfc3339(&self) -> String {
        self.started_at.format(&Rfc3339).unwrap_or_default()
    }

    pub fn ended_at_rfc3339(&self) -> String {
        self.ended_at.format(&Rfc3339).unwrap_or_default()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::plan::site::{Plugin, Site, SourceType};

    pub(crate) fn task(site: &str, plugin: &str) -> Task {
        Task::new(
            Site::new(site, "192.0.2.4", "deploy", "/srv/www", "https://example.org"),
            Plugin::new(plugin, "https://vendor.example.org/p.zip", SourceType::Url),
        )
    }

    fn session(exit_code: i32, stdout: &str, stderr: &str) -> SessionOutput {
        SessionOutput {
            exit_code: Some(exit_code),
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    #[test]
    fn test_markers_populate_result() {
        let stdout = "MARKER from_version=2.1.0\nMARKER to_version=2.2.0\n\
                      MARKER backup_path=/home/deploy/plugin-backups/acf.tar.gz\n\
                      MARKER http_code=200\nMARKER maintenance_cleared=true\nMARKER status=ok\n";
        let result =
            TaskResult::from_session(task("shop", "acf"), session(0, stdout, ""), Stopwatch::start());
        assert_eq!(Status::Ok, *result.status());
        assert_eq!("2.1.0", result.from_version());
        assert_eq!("2.2.0", result.to_version());
        assert_eq!("200", result.http_code());
        assert_eq!("true", result.maintenance_cleared());
        assert_eq!("", result.error_message());
        assert_eq!(stdout, result.stdout());
    }

    #[test]
    fn test_missing_markers_default() {
        let result =
            TaskResult::from_session(task("shop", "acf"), session(0, "", ""), Stopwatch::start());
        assert_eq!(Status::Failed, *result.status());
        assert_eq!(NONE_SENTINEL, result.from_version());
        assert_eq!(NONE_SENTINEL, result.to_version());
        assert_eq!(NONE_SENTINEL, result.backup_path());
        assert_eq!("0", result.http_code());
        assert_eq!("false", result.maintenance_cleared());
        assert_eq!("remote script reported no status", result.error_message());
    }

    #[test]
    fn test_nonzero_exit_without_status_is_failed() {
        let result =
            TaskResult::from_session(task("shop", "acf"), session(3, "", ""), Stopwatch::start());
        assert_eq!(Status::Failed, *result.status());
        assert_eq!("SSH command exited with code 3", result.error_message());
    }

    #[test]
    fn test_connection_failures_are_classified() {
        let result = TaskResult::from_session(
            task("shop", "acf"),
            session(255, "", "ssh: connect to host 192.0.2.4 port 22: Connection refused"),
            Stopwatch::start(),
        );
        assert_eq!(
            "SSH_CONNECT_FAIL: SSH command exited with code 255",
            result.error_message()
        );

        let result = TaskResult::from_session(
            task("shop", "acf"),
            session(255, "", "deploy@192.0.2.4: Permission denied (publickey)."),
            Stopwatch::start(),
        );
        assert!(result.error_message().starts_with("SSH_CONNECT_FAIL: "));
    }

    #[test]
    fn test_wp_not_installed_is_classified_with_remote_error() {
        let stdout = "WP_NOT_INSTALLED\nMARKER error=WordPress not found in /srv/www\n";
        let result =
            TaskResult::from_session(task("shop", "acf"), session(1, stdout, ""), Stopwatch::start());
        assert_eq!(
            "WP_NOT_INSTALLED: WordPress not found in /srv/www",
            result.error_message()
        );
    }

    #[test]
    fn test_explicit_status_overrides_exit_code() {
        let stdout = "MARKER status=needs_attention\nMARKER http_code=503\n\
                      MARKER error=HTTP_UNHEALTHY: site returned 503\n";
        let result = TaskResult::from_session(
            task("shop", "acf"),
            session(1, stdout, "Connection refused"),
            Stopwatch::start(),
        );
        assert_eq!(Status::NeedsAttention, *result.status());
        assert_eq!("HTTP_UNHEALTHY: site returned 503", result.error_message());
    }

    #[test]
    fn test_unknown_status_counts_as_failed() {
        let result = TaskResult::from_session(
            task("shop", "acf"),
            session(0, "MARKER status=skipped", ""),
            Stopwatch::start(),
        );
        assert_eq!(Status::Failed, *result.status());
        assert_eq!(
            "UNKNOWN_STATUS: remote script reported status `skipped`",
            result.error_message()
        );
    }

    #[test]
    fn test_persisted_ids_are_recorded() {
        let result = TaskResult::failed(task("shop", "acf"), "x", Stopwatch::start())
            .persisted_as(4, 19);
        assert_eq!(Some(4), *result.task().run_id());
        assert_eq!(Some(19), *result.task().task_id());
        assert!(result.ended_at() >= result.started_at());
    }
}
