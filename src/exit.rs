use std::fmt;

use crate::error::ScanError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success,
    InvalidArgs,
    ScanFailed,
    DatabaseMissing,
    ParseFailed,
    ExternalCommandFailed,
    RuntimeUnavailable,
}

impl ExitCode {
    pub const fn as_i32(self) -> i32 {
        match self {
            ExitCode::Success => 0,
            ExitCode::InvalidArgs => 2,
            ExitCode::ScanFailed => 10,
            ExitCode::DatabaseMissing => 11,
            ExitCode::ParseFailed => 12,
            ExitCode::ExternalCommandFailed => 20,
            ExitCode::RuntimeUnavailable => 21,
        }
    }
}

#[derive(Debug)]
pub struct ExitError {
    pub code: ExitCode,
    pub err: anyhow::Error,
}

impl ExitError {
    pub fn new(code: ExitCode, err: anyhow::Error) -> Self {
        Self { code, err }
    }
}

impl fmt::Display for ExitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.err.fmt(f)
    }
}

impl std::error::Error for ExitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.err.as_ref())
    }
}

pub fn exit_code(err: &anyhow::Error) -> i32 {
    if let Some(exit) = err.downcast_ref::<ExitError>() {
        return exit.code.as_i32();
    }
    if let Some(scan) = err.downcast_ref::<ScanError>() {
        return code_for_scan_error(scan).as_i32();
    }
    ExitCode::ScanFailed.as_i32()
}

pub fn code_for_scan_error(err: &ScanError) -> ExitCode {
    match err {
        ScanError::Execution { .. } | ScanError::TimedOut { .. } => {
            ExitCode::ExternalCommandFailed
        }
        ScanError::NonZeroExit { .. } | ScanError::Io { .. } => ExitCode::ScanFailed,
        ScanError::DatabaseMissing { .. } => ExitCode::DatabaseMissing,
        ScanError::Parse(_) => ExitCode::ParseFailed,
        ScanError::RuntimeUnavailable(_) => ExitCode::RuntimeUnavailable,
    }
}

pub fn invalid_args(message: impl Into<String>) -> anyhow::Error {
    ExitError::new(ExitCode::InvalidArgs, anyhow::anyhow!(message.into())).into()
}

pub fn invalid_args_err(err: anyhow::Error) -> anyhow::Error {
    ExitError::new(ExitCode::InvalidArgs, err).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn scan_errors_map_to_distinct_codes() {
        let missing: anyhow::Error = ScanError::DatabaseMissing {
            path: PathBuf::from("/tmp/db"),
        }
        .into();
        assert_eq!(exit_code(&missing), 11);

        let parse_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let parse: anyhow::Error = ScanError::Parse(parse_err).into();
        assert_eq!(exit_code(&parse), 12);

        let runtime: anyhow::Error = ScanError::RuntimeUnavailable("down".to_string()).into();
        assert_eq!(exit_code(&runtime), 21);
    }

    #[test]
    fn context_does_not_hide_scan_error_code() {
        use anyhow::Context;

        let res: Result<(), ScanError> = Err(ScanError::NonZeroExit {
            program: "docker".to_string(),
            exit_code: 1,
            stderr: "boom".to_string(),
        });
        let err = res.context("scan nginx:latest").unwrap_err();
        assert_eq!(exit_code(&err), 10);
    }

    #[test]
    fn exit_error_takes_precedence() {
        assert_eq!(exit_code(&invalid_args("bad")), 2);
        assert_eq!(exit_code(&anyhow::anyhow!("other")), 10);
    }
}
