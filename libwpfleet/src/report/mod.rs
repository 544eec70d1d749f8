//! Per-run reports, built only from the in-memory result collection: a CSV
//! export with one row per task and a Markdown summary grouped by status,
//! problems first.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use color_eyre::eyre::{Context, Result};
use derive_getters::Getters;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::executor::{Status, TaskResult};
use crate::log::*;
use crate::store::RunStats;

const CSV_HEADERS: [&str; 9] = [
    "site",
    "plugin",
    "status",
    "from_version",
    "to_version",
    "http_code",
    "maintenance_cleared",
    "duration_ms",
    "error_message",
];

#[derive(Getters, Debug, Clone, PartialEq, Eq)]
pub struct ReportPaths {
    csv: PathBuf,
    markdown: PathBuf,
}

/// `YYYYMMDD-HHMMSS` in UTC, used in report file names and headers.
pub fn file_stamp(at: OffsetDateTime) -> String {
    at.format(format_description!(
        "[year][month][day]-[hour][minute][second]"
    ))
    .unwrap_or_default()
}

fn status_heading(status: Status) -> (&'static str, &'static str) {
    match status {
        Status::Failed => ("❌", "FAILED"),
        Status::NeedsAttention => ("⚠️", "NEEDS ATTENTION"),
        Status::Ok => ("✅", "OK"),
    }
}

pub fn render_csv(results: &[TaskResult]) -> Result<String> {
    let mut writer = csv::Writer::from_writer(vec![]);
    writer.write_record(CSV_HEADERS)?;
    for result in results {
        writer.write_record([
            result.task().site().name().as_str(),
            result.task().plugin().slug().as_str(),
            result.status().as_str(),
            result.from_version().as_str(),
            result.to_version().as_str(),
            result.http_code().as_str(),
            result.maintenance_cleared().as_str(),
            result.duration_ms().to_string().as_str(),
            result.error_message().as_str(),
        ])?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| e.into_error())
        .context("flushing CSV report")?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

pub fn render_markdown(run_id: i64, stamp: &str, results: &[TaskResult]) -> String {
    let stats = RunStats::from_results(results);
    let mut out = String::new();

    // Writing into a String cannot fail.
    let _ = write!(
        out,
        "# WordPress Plugin Update Report\n\n\
         **Run ID:** {run_id}\n\n\
         **Timestamp:** {stamp}\n\n\
         ## Summary\n\n\
         | Status | Count |\n\
         |--------|-------|\n\
         | ✅ OK | {} |\n\
         | ⚠️  Needs Attention | {} |\n\
         | ❌ Failed | {} |\n\
         | **Total** | **{}** |\n\n\
         ## Task Details\n\n",
        stats.ok(),
        stats.needs_attention(),
        stats.failed(),
        stats.total(),
    );

    for status in Status::PRIORITY {
        let mut group = results.iter().filter(|r| *r.status() == status).peekable();
        if group.peek().is_none() {
            continue;
        }
        let (emoji, title) = status_heading(status);
        let _ = write!(out, "### {emoji} {title}\n\n");

        for result in group {
            let _ = write!(
                out,
                "**{}** / `{}`\n\n\
                 - Version: {} → {}\n\
                 - HTTP Code: {}\n\
                 - Maintenance Cleared: {}\n\
                 - Duration: {}ms\n",
                result.task().site().name(),
                result.task().plugin().slug(),
                result.from_version(),
                result.to_version(),
                result.http_code(),
                result.maintenance_cleared(),
                result.duration_ms(),
            );
            if !result.error_message().is_empty() {
                let _ = writeln!(out, "- Error: `{}`", result.error_message());
            }
            out.push('\n');
        }
    }
    out
}

/// Write `run-<run_id>-<stamp>.csv` and `run-<run_id>-<stamp>.md` under
/// `report_dir`, stamped with the run's completion time. Runs finishing in
/// the same second still get their own files.
#[tracing::instrument(skip(results), fields(results = results.len()))]
pub async fn write_reports(
    report_dir: &Path,
    run_id: i64,
    results: &[TaskResult],
    completed_at: OffsetDateTime,
) -> Result<ReportPaths> {
    tokio::fs::create_dir_all(report_dir)
        .await
        .with_context(|| format!("creating report directory {}", report_dir.display()))?;

    let stamp = file_stamp(completed_at);
    let paths = ReportPaths {
        csv: report_dir.join(format!("run-{run_id}-{stamp}.csv")),
        markdown: report_dir.join(format!("run-{run_id}-{stamp}.md")),
    };

    tokio::fs::write(&paths.csv, render_csv(results)?)
        .await
        .with_context(|| format!("writing {}", paths.csv.display()))?;
    info!("CSV report written: {}", paths.csv.display());

    tokio::fs::write(&paths.markdown, render_markdown(run_id, &stamp, results))
        .await
        .with_context(|| format!("writing {}", paths.markdown.display()))?;
    info!("Markdown report written: {}", paths.markdown.display());

    Ok(paths)
}
