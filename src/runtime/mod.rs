use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ScanError;
use crate::platform::{CommandOutput, CommandRunner, CommandSpec};

/// A bind mount passed as `-v host:container[:ro]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: String,
    pub container: String,
    pub read_only: bool,
}

impl Mount {
    pub fn read_only(host: impl AsRef<Path>, container: impl Into<String>) -> Self {
        Self {
            host: host.as_ref().display().to_string(),
            container: container.into(),
            read_only: true,
        }
    }

    pub fn read_write(host: impl AsRef<Path>, container: impl Into<String>) -> Self {
        Self {
            host: host.as_ref().display().to_string(),
            container: container.into(),
            read_only: false,
        }
    }

    fn volume_arg(&self) -> String {
        if self.read_only {
            format!("{}:{}:ro", self.host, self.container)
        } else {
            format!("{}:{}", self.host, self.container)
        }
    }
}

/// A transient `run --rm` invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSpec {
    pub name: Option<String>,
    pub image: String,
    pub mounts: Vec<Mount>,
    pub env: Vec<(String, String)>,
    pub args: Vec<String>,
}

impl RunSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Self::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn mount(mut self, mount: Mount) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
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

    pub fn to_args(&self) -> Vec<String> {
        let mut out = vec!["run".to_string(), "--rm".to_string()];
        if let Some(name) = &self.name {
            out.push("--name".to_string());
            out.push(name.clone());
        }
        for mount in &self.mounts {
            out.push("-v".to_string());
            out.push(mount.volume_arg());
        }
        for (k, v) in &self.env {
            out.push("-e".to_string());
            out.push(format!("{k}={v}"));
        }
        out.push(self.image.clone());
        out.extend(self.args.iter().cloned());
        out
    }
}

/// Raw image metadata as printed by `image inspect`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectedImage {
    pub id: String,
    #[serde(default)]
    pub repo_tags: Option<Vec<String>>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub created: String,
}

/// Client for a docker-compatible container runtime CLI.
#[derive(Clone)]
pub struct ContainerRuntime {
    runner: Arc<dyn CommandRunner>,
    binary: String,
    timeout: Option<Duration>,
}

impl ContainerRuntime {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        binary: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            runner,
            binary: binary.into(),
            timeout,
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    pub fn pull(&self, image: &str) -> Result<(), ScanError> {
        log::info!("Pulling {image}...");
        let out = self.exec(["pull", image])?;
        self.require_success(out).map(|_| ())
    }

    /// Runs a transient container. The output is returned whatever the exit status.
    ///
    /// Unnamed specs get a generated name so a timed-out container can be
    /// force-removed; killing the client alone leaves it running in the daemon.
    pub fn run(&self, spec: &RunSpec) -> Result<CommandOutput, ScanError> {
        let name = spec.name.clone().unwrap_or_else(container_name);
        let args = RunSpec {
            name: Some(name.clone()),
            ..spec.clone()
        }
        .to_args();
        match self.exec(args) {
            Err(err @ ScanError::TimedOut { .. }) => {
                self.force_remove(&name);
                Err(err)
            }
            res => res,
        }
    }

    fn force_remove(&self, name: &str) {
        log::warn!("Removing timed-out container {name}");
        match self.exec(["rm", "-f", name]) {
            Ok(out) if out.success() => {}
            Ok(out) => log::warn!("failed to remove container {name}: {}", out.stderr_lossy()),
            Err(err) => log::warn!("failed to remove container {name}: {err}"),
        }
    }

    pub fn list_image_ids(&self) -> Result<Vec<String>, ScanError> {
        let out = self
            .exec(["image", "ls", "--quiet", "--no-trunc"])
            .map_err(runtime_unavailable)?;
        if !out.success() {
            return Err(ScanError::RuntimeUnavailable(out.stderr_lossy()));
        }

        let mut ids: Vec<String> = Vec::new();
        for line in out.stdout_lossy().lines() {
            let id = line.trim();
            if id.is_empty() || ids.iter().any(|seen| seen == id) {
                continue;
            }
            ids.push(id.to_string());
        }
        Ok(ids)
    }

    pub fn inspect_images(&self, ids: &[String]) -> Result<Vec<InspectedImage>, ScanError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec!["image".to_string(), "inspect".to_string()];
        args.extend(ids.iter().cloned());
        let out = self.exec(args).map_err(runtime_unavailable)?;
        let out = self.require_success(out)?;
        serde_json::from_slice(&out.stdout).map_err(ScanError::Parse)
    }

    fn exec<I, S>(&self, args: I) -> Result<CommandOutput, ScanError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spec = CommandSpec::new(&self.binary)
            .args(args)
            .timeout(self.timeout);
        self.runner.run(&spec)
    }

    fn require_success(&self, out: CommandOutput) -> Result<CommandOutput, ScanError> {
        if out.success() {
            return Ok(out);
        }
        Err(ScanError::NonZeroExit {
            program: self.binary.clone(),
            exit_code: out.exit_code,
            stderr: out.stderr_lossy(),
        })
    }
}

fn container_name() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("trivy-offline-{}-{seq}", std::process::id())
}

fn runtime_unavailable(err: ScanError) -> ScanError {
    match err {
        ScanError::Execution { program, source } => {
            ScanError::RuntimeUnavailable(format!("{program}: {source}"))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::testing::FakeRunner;

    fn runtime(fake: &Arc<FakeRunner>) -> ContainerRuntime {
        ContainerRuntime::new(fake.clone(), "docker", None)
    }

    #[test]
    fn run_spec_renders_mounts_then_env_then_image() {
        let spec = RunSpec::new("alpine:3")
            .mount(Mount::read_only("/var/run/docker.sock", "/var/run/docker.sock"))
            .mount(Mount::read_write("/data/cache", "/cache"))
            .env("A", "1")
            .args(["echo", "hi"]);
        assert_eq!(
            spec.to_args(),
            vec![
                "run",
                "--rm",
                "-v",
                "/var/run/docker.sock:/var/run/docker.sock:ro",
                "-v",
                "/data/cache:/cache",
                "-e",
                "A=1",
                "alpine:3",
                "echo",
                "hi",
            ]
        );
    }

    #[test]
    fn named_spec_renders_name_after_rm() {
        let args = RunSpec::new("alpine:3").name("job-1").to_args();
        assert_eq!(args, vec!["run", "--rm", "--name", "job-1", "alpine:3"]);
    }

    #[test]
    fn run_assigns_a_unique_container_name() {
        let fake = Arc::new(FakeRunner::new());
        let rt = runtime(&fake);
        let spec = RunSpec::new("alpine:3").args(["true"]);
        rt.run(&spec).expect("run 1");
        rt.run(&spec).expect("run 2");

        let calls = fake.calls();
        assert_eq!(calls[0].args[2], "--name");
        assert!(calls[0].args[3].starts_with("trivy-offline-"), "{:?}", calls[0].args);
        assert_ne!(calls[0].args[3], calls[1].args[3]);
        assert_eq!(calls[0].args[4..], ["alpine:3", "true"]);
    }

    #[test]
    fn timed_out_container_is_force_removed() {
        let fake = Arc::new(FakeRunner::new());
        fake.push(Err(ScanError::TimedOut {
            program: "docker".to_string(),
            timeout: Duration::from_millis(200),
        }));
        let err = runtime(&fake)
            .run(&RunSpec::new("aquasec/trivy:latest").name("scan-7"))
            .unwrap_err();
        assert!(matches!(err, ScanError::TimedOut { .. }), "{err:?}");

        let calls = fake.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].args, vec!["rm", "-f", "scan-7"]);
    }

    #[test]
    fn non_zero_run_does_not_remove_container() {
        let fake = Arc::new(FakeRunner::new());
        fake.push_exit(1, "boom");
        let out = runtime(&fake).run(&RunSpec::new("alpine:3")).expect("run");
        assert_eq!(out.exit_code, 1);
        assert_eq!(fake.calls().len(), 1);
    }

    #[test]
    fn pull_failure_is_reported_with_stderr() {
        let fake = Arc::new(FakeRunner::new());
        fake.push_exit(1, "manifest unknown\n");
        let err = runtime(&fake).pull("nope:latest").unwrap_err();
        match err {
            ScanError::NonZeroExit {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, 1);
                assert_eq!(stderr, "manifest unknown");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(fake.calls()[0].args, vec!["pull", "nope:latest"]);
    }

    #[test]
    fn list_image_ids_dedupes_multi_tagged_images() {
        let fake = Arc::new(FakeRunner::new());
        fake.push_ok("sha256:aaa\nsha256:bbb\nsha256:aaa\n\n");
        let ids = runtime(&fake).list_image_ids().expect("ids");
        assert_eq!(ids, vec!["sha256:aaa", "sha256:bbb"]);
    }

    #[test]
    fn daemon_down_is_runtime_unavailable() {
        let fake = Arc::new(FakeRunner::new());
        fake.push_exit(1, "Cannot connect to the Docker daemon");
        let err = runtime(&fake).list_image_ids().unwrap_err();
        assert!(matches!(err, ScanError::RuntimeUnavailable(_)), "{err:?}");
    }

    #[test]
    fn inspect_accepts_null_repo_tags() {
        let fake = Arc::new(FakeRunner::new());
        fake.push_ok(
            r#"[{"Id":"sha256:0123456789abcdef","RepoTags":null,"Size":42,"Created":"2024-01-01T00:00:00Z"}]"#,
        );
        let images = runtime(&fake)
            .inspect_images(&["sha256:0123456789abcdef".to_string()])
            .expect("inspect");
        assert_eq!(images.len(), 1);
        assert!(images[0].repo_tags.is_none());
        assert_eq!(images[0].size, 42);
    }
}
