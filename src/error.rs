use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScanError {
    /// The external program could not be started at all.
    #[error("failed to launch {program}")]
    Execution {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} did not finish within {timeout:?}")]
    TimedOut { program: String, timeout: Duration },
    /// The program ran and reported failure.
    #[error("{program} exited with status {exit_code}: {stderr}")]
    NonZeroExit {
        program: String,
        exit_code: i32,
        stderr: String,
    },
    #[error(
        "vulnerability database not found in {} (run `trivy-offline setup` first)",
        path.display()
    )]
    DatabaseMissing { path: PathBuf },
    #[error("failed to decode scanner output as JSON")]
    Parse(#[source] serde_json::Error),
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),
    #[error("{context}: {}", path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ScanError {
    pub(crate) fn io(context: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        ScanError::Io {
            context,
            path: path.into(),
            source,
        }
    }
}
