use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use wait_timeout::ChildExt;

use crate::error::ScanError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Shell-ish rendering for log lines.
    pub fn cmdline(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                out.push_str(&format!("{arg:?}"));
            } else {
                out.push_str(arg);
            }
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim_end().to_string()
    }
}

/// Runs an external program to completion.
///
/// A non-zero exit status is an ordinary `CommandOutput`; only failing to
/// launch (or wait for) the program is an error.
pub trait CommandRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ScanError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ScanError> {
        log::debug!("exec: {}", spec.cmdline());

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|source| ScanError::Execution {
            program: spec.program.clone(),
            source,
        })?;

        // Drain both pipes while waiting; scanner JSON easily exceeds the pipe buffer.
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let status = match spec.timeout {
            Some(timeout) => match child.wait_timeout(timeout) {
                Ok(Some(status)) => status,
                Ok(None) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ScanError::TimedOut {
                        program: spec.program.clone(),
                        timeout,
                    });
                }
                Err(source) => {
                    return Err(ScanError::Execution {
                        program: spec.program.clone(),
                        source,
                    });
                }
            },
            None => child.wait().map_err(|source| ScanError::Execution {
                program: spec.program.clone(),
                source,
            })?,
        };

        let stdout = stdout.map(join_drain).unwrap_or_default();
        let stderr = stderr.map(join_drain).unwrap_or_default();

        Ok(CommandOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout,
            stderr,
        })
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn join_drain(handle: thread::JoinHandle<Vec<u8>>) -> Vec<u8> {
    handle.join().unwrap_or_default()
}

pub fn effective_home_dir() -> Result<PathBuf> {
    std::env::var_os("HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("HOME is not set"))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    /// Records every spec it is asked to run and replays queued outputs in order.
    /// Once the queue is empty it answers with a successful, empty output.
    #[derive(Default)]
    pub struct FakeRunner {
        calls: Mutex<Vec<CommandSpec>>,
        replies: Mutex<VecDeque<Result<CommandOutput, ScanError>>>,
    }

    impl FakeRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_ok(&self, stdout: &str) -> &Self {
            self.push(Ok(CommandOutput {
                exit_code: 0,
                stdout: stdout.as_bytes().to_vec(),
                stderr: Vec::new(),
            }))
        }

        pub fn push_exit(&self, exit_code: i32, stderr: &str) -> &Self {
            self.push(Ok(CommandOutput {
                exit_code,
                stdout: Vec::new(),
                stderr: stderr.as_bytes().to_vec(),
            }))
        }

        pub fn push(&self, reply: Result<CommandOutput, ScanError>) -> &Self {
            self.replies.lock().unwrap().push_back(reply);
            self
        }

        pub fn calls(&self) -> Vec<CommandSpec> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl CommandRunner for FakeRunner {
        fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ScanError> {
            self.calls.lock().unwrap().push(spec.clone());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(CommandOutput::default()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmdline_quotes_arguments_with_spaces() {
        let spec = CommandSpec::new("docker")
            .args(["run", "--rm"])
            .arg("sh")
            .arg("-c")
            .arg("cp -r /a/* /b/");
        assert_eq!(spec.cmdline(), r#"docker run --rm sh -c "cp -r /a/* /b/""#);
    }

    #[test]
    fn missing_program_is_an_execution_error() {
        let spec = CommandSpec::new("/nonexistent/trivy-offline-test-binary");
        let err = SystemRunner.run(&spec).unwrap_err();
        assert!(matches!(err, ScanError::Execution { .. }), "{err:?}");
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_is_not_an_error() {
        let spec = CommandSpec::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]);
        let out = SystemRunner.run(&spec).expect("run sh");
        assert_eq!(out.exit_code, 3);
        assert!(!out.success());
        assert_eq!(out.stdout, b"out\n");
        assert_eq!(out.stderr_lossy(), "err");
    }

    #[cfg(unix)]
    #[test]
    fn large_output_does_not_block() {
        let spec = CommandSpec::new("sh")
            .args(["-c", "head -c 300000 /dev/zero"])
            .timeout(Some(Duration::from_secs(20)));
        let out = SystemRunner.run(&spec).expect("run sh");
        assert!(out.success());
        assert_eq!(out.stdout.len(), 300_000);
    }

    #[cfg(unix)]
    #[test]
    fn timeout_kills_the_child() {
        let spec = CommandSpec::new("sh")
            .args(["-c", "sleep 5"])
            .timeout(Some(Duration::from_millis(100)));
        let err = SystemRunner.run(&spec).unwrap_err();
        assert!(matches!(err, ScanError::TimedOut { .. }), "{err:?}");
    }
}
