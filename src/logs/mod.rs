use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::core::VulnerabilitySummary;

const MAX_ERROR_BYTES: usize = 64 * 1024;

#[derive(Debug, Serialize)]
struct RunLog<'a> {
    schema_version: &'static str,
    tool_version: String,
    command: &'a str,
    started_at: String,
    finished_at: String,
    status: &'static str,
    targets: Vec<TargetLog>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetLog {
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<VulnerabilitySummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TargetLog {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            format: None,
            saved_to: None,
            summary: None,
            error: None,
        }
    }

    pub fn failed(mut self, err: &dyn std::fmt::Display) -> Self {
        self.error = Some(truncate(&err.to_string(), MAX_ERROR_BYTES));
        self
    }
}

/// Writes one JSON record per command run under `logs_dir`.
pub fn write_run_log(
    logs_dir: &Path,
    command: &str,
    started_at: OffsetDateTime,
    finished_at: OffsetDateTime,
    targets: Vec<TargetLog>,
) -> Result<PathBuf> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("failed to create log directory: {}", logs_dir.display()))?;

    let pid = std::process::id();
    let ts = finished_at.unix_timestamp_nanos();
    let file_name = format!("{}-{pid}-{ts}.json", command.replace(' ', "-"));
    let path = logs_dir.join(file_name);

    let failed = targets.iter().filter(|t| t.error.is_some()).count();
    let status = if failed == 0 {
        "ok"
    } else if failed == targets.len() {
        "error"
    } else {
        "partial_error"
    };

    let log = RunLog {
        schema_version: "1.0",
        tool_version: env!("CARGO_PKG_VERSION").to_string(),
        command,
        started_at: format_ts(started_at),
        finished_at: format_ts(finished_at),
        status,
        targets,
    };

    let buf = serde_json::to_vec_pretty(&log).context("failed to serialize run log")?;
    std::fs::write(&path, buf)
        .with_context(|| format!("failed to write run log: {}", path.display()))?;
    Ok(path)
}

/// Like [`write_run_log`], but only warns on failure.
pub fn record_run(
    logs_dir: &Path,
    command: &str,
    started_at: OffsetDateTime,
    targets: Vec<TargetLog>,
) {
    match write_run_log(logs_dir, command, started_at, OffsetDateTime::now_utc(), targets) {
        Ok(path) => log::debug!("run log written: {}", path.display()),
        Err(err) => log::warn!("{err:#}"),
    }
}

fn format_ts(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339).unwrap_or_else(|_| "unknown".to_string())
}

fn truncate(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…(truncated)", &s[..end])
}
