use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::core::{OutputFormat, ScanRequest, Severity};
use crate::db;
use crate::error::ScanError;
use crate::runtime::{ContainerRuntime, Mount, RunSpec};

const CONTAINER_CACHE_DIR: &str = "/root/.cache/trivy";
const CONTAINER_DB_DIR: &str = "/trivy-db";

#[derive(Debug, Clone)]
pub struct ScannerPaths {
    pub db_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub results_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanPayload {
    Json(Value),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanOutcome {
    pub payload: ScanPayload,
    pub saved_to: Option<PathBuf>,
}

impl ScanOutcome {
    pub fn json(&self) -> Option<&Value> {
        match &self.payload {
            ScanPayload::Json(v) => Some(v),
            ScanPayload::Text(_) => None,
        }
    }
}

pub type BatchResults = BTreeMap<String, Result<ScanOutcome, ScanError>>;

/// Runs the scanner container against images using the locally staged database.
#[derive(Clone)]
pub struct Scanner {
    runtime: ContainerRuntime,
    scanner_image: String,
    socket: String,
    paths: ScannerPaths,
}

impl Scanner {
    pub fn new(
        runtime: ContainerRuntime,
        scanner_image: impl Into<String>,
        socket: impl Into<String>,
        paths: ScannerPaths,
    ) -> Self {
        Self {
            runtime,
            scanner_image: scanner_image.into(),
            socket: socket.into(),
            paths,
        }
    }

    /// The container invocation for `req`. The database is mounted read-only and
    /// the scanner never contacts a remote repository.
    pub fn run_spec(&self, req: &ScanRequest) -> RunSpec {
        let mut args = vec![
            "image".to_string(),
            "--format".to_string(),
            req.format.as_str().to_string(),
        ];
        if !req.severities.is_empty() {
            args.push("--severity".to_string());
            args.push(join(req.severities.iter().map(|s| s.as_str())));
        }
        if !req.vuln_types.is_empty() {
            args.push("--vuln-type".to_string());
            args.push(join(req.vuln_types.iter().map(|t| t.as_str())));
        }
        args.push(req.image.clone());

        RunSpec::new(&self.scanner_image)
            .mount(Mount::read_only(&self.socket, self.socket.clone()))
            .mount(Mount::read_write(&self.paths.cache_dir, CONTAINER_CACHE_DIR))
            .mount(Mount::read_only(&self.paths.db_dir, CONTAINER_DB_DIR))
            .env("TRIVY_CACHE_DIR", CONTAINER_CACHE_DIR)
            .env("TRIVY_DB_REPOSITORY", format!("file://{CONTAINER_DB_DIR}"))
            .env("TRIVY_SKIP_UPDATE", "true")
            .args(args)
    }

    pub fn scan_image(&self, req: &ScanRequest) -> Result<ScanOutcome, ScanError> {
        if !db::has_database(&self.paths.db_dir) {
            log::error!(
                "Vulnerability database not found in {}. Run setup first.",
                self.paths.db_dir.display()
            );
            return Err(ScanError::DatabaseMissing {
                path: self.paths.db_dir.clone(),
            });
        }

        let out = self.runtime.run(&self.run_spec(req))?;
        if !out.success() {
            let stderr = out.stderr_lossy();
            log::error!("Scan of {} failed: {stderr}", req.image);
            return Err(ScanError::NonZeroExit {
                program: self.runtime.binary().to_string(),
                exit_code: out.exit_code,
                stderr,
            });
        }

        let saved_to = match &req.output_file {
            Some(name) => Some(self.save_output(name, &out.stdout)?),
            None => None,
        };

        let payload = match req.format {
            OutputFormat::Json => {
                let v = serde_json::from_slice(&out.stdout).map_err(|e| {
                    log::error!("Failed to parse scanner output for {}: {e}", req.image);
                    ScanError::Parse(e)
                })?;
                ScanPayload::Json(v)
            }
            _ => ScanPayload::Text(out.stdout_lossy()),
        };

        Ok(ScanOutcome { payload, saved_to })
    }

    /// Scans each image in turn. A failing image does not stop the batch.
    pub fn scan_multiple_images(
        &self,
        images: &[String],
        format: OutputFormat,
        severities: &[Severity],
    ) -> BatchResults {
        let mut results = BatchResults::new();
        for image in images {
            log::info!("Scanning {image}...");
            let req = ScanRequest::new(image.clone(), format).with_severities(severities.to_vec());
            results.insert(image.clone(), self.scan_image(&req));
        }
        results
    }

    fn save_output(&self, name: &Path, stdout: &[u8]) -> Result<PathBuf, ScanError> {
        let path = self.paths.results_dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ScanError::io("failed to create results directory", parent, e))?;
        }
        std::fs::write(&path, stdout)
            .map_err(|e| ScanError::io("failed to write scan results", &path, e))?;
        log::info!("Results saved to: {}", path.display());
        Ok(path)
    }
}

fn join<'a>(items: impl Iterator<Item = &'a str>) -> String {
    items.collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::VulnType;
    use crate::platform::testing::FakeRunner;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    const REPORT: &str = r#"{"ArtifactName":"nginx:latest","Results":[{"Target":"nginx","Vulnerabilities":[{"Severity":"CRITICAL"},{"Severity":"CRITICAL"},{"Severity":"LOW"}]}]}"#;

    fn make_temp_dir() -> PathBuf {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        let seq = SEQ.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "trivy-offline-scan-test-{}-{seq}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).expect("create dir");
        dir
    }

    fn scanner(fake: &Arc<FakeRunner>, root: &Path, with_db: bool) -> Scanner {
        let paths = ScannerPaths {
            db_dir: root.join("db"),
            cache_dir: root.join("cache"),
            results_dir: root.join("results"),
        };
        std::fs::create_dir_all(&paths.db_dir).expect("mkdir");
        if with_db {
            std::fs::write(paths.db_dir.join("trivy.db"), b"db").expect("write");
        }
        Scanner::new(
            ContainerRuntime::new(fake.clone(), "docker", None),
            "aquasec/trivy:latest",
            "/var/run/docker.sock",
            paths,
        )
    }

    #[test]
    fn missing_database_never_invokes_runtime() {
        let root = make_temp_dir();
        let fake = Arc::new(FakeRunner::new());
        let s = scanner(&fake, &root, false);

        let err = s
            .scan_image(&ScanRequest::new("nginx:latest", OutputFormat::Json))
            .unwrap_err();
        assert!(matches!(err, ScanError::DatabaseMissing { .. }), "{err:?}");

        std::fs::remove_dir_all(root.join("db")).expect("rm");
        assert!(s.scan_image(&ScanRequest::new("nginx:latest", OutputFormat::Table)).is_err());
        assert!(fake.calls().is_empty());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn invocation_is_offline_and_ends_with_image() {
        let root = make_temp_dir();
        let fake = Arc::new(FakeRunner::new());
        let s = scanner(&fake, &root, true);
        let req = ScanRequest::new("nginx:latest", OutputFormat::Json)
            .with_severities([Severity::High, Severity::Critical])
            .with_vuln_types([VulnType::Library, VulnType::Os]);

        let args = s.run_spec(&req).to_args();
        let expected: Vec<String> = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-v".to_string(),
            "/var/run/docker.sock:/var/run/docker.sock:ro".to_string(),
            "-v".to_string(),
            format!("{}:/root/.cache/trivy", root.join("cache").display()),
            "-v".to_string(),
            format!("{}:/trivy-db:ro", root.join("db").display()),
            "-e".to_string(),
            "TRIVY_CACHE_DIR=/root/.cache/trivy".to_string(),
            "-e".to_string(),
            "TRIVY_DB_REPOSITORY=file:///trivy-db".to_string(),
            "-e".to_string(),
            "TRIVY_SKIP_UPDATE=true".to_string(),
            "aquasec/trivy:latest".to_string(),
            "image".to_string(),
            "--format".to_string(),
            "json".to_string(),
            "--severity".to_string(),
            "CRITICAL,HIGH".to_string(),
            "--vuln-type".to_string(),
            "os,library".to_string(),
            "nginx:latest".to_string(),
        ];
        assert_eq!(args, expected);
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn filters_are_omitted_when_empty() {
        let root = make_temp_dir();
        let fake = Arc::new(FakeRunner::new());
        let s = scanner(&fake, &root, true);
        let args = s
            .run_spec(&ScanRequest::new("alpine:3", OutputFormat::Table))
            .to_args();
        assert!(!args.iter().any(|a| a == "--severity" || a == "--vuln-type"));
        assert_eq!(args.last().map(String::as_str), Some("alpine:3"));
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn json_output_is_decoded_and_saved_verbatim() {
        let root = make_temp_dir();
        let fake = Arc::new(FakeRunner::new());
        fake.push_ok(REPORT);
        let s = scanner(&fake, &root, true);
        let req = ScanRequest::new("nginx:latest", OutputFormat::Json)
            .with_output_file(Some(PathBuf::from("nginx.json")));

        let outcome = s.scan_image(&req).expect("scan");
        let saved = outcome.saved_to.clone().expect("saved");
        assert_eq!(saved, root.join("results/nginx.json"));
        assert_eq!(std::fs::read(&saved).expect("read"), REPORT.as_bytes());

        let summary = crate::summary::summarize(outcome.json().expect("json"));
        assert_eq!(summary.critical, 2);
        assert_eq!(summary.low, 1);
        assert_eq!(summary.total, 3);
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn output_file_is_overwritten() {
        let root = make_temp_dir();
        let fake = Arc::new(FakeRunner::new());
        fake.push_ok("first run, longer text\n").push_ok("second\n");
        let s = scanner(&fake, &root, true);
        let req = ScanRequest::new("alpine:3", OutputFormat::Table)
            .with_output_file(Some(PathBuf::from("alpine.txt")));

        s.scan_image(&req).expect("scan 1");
        let outcome = s.scan_image(&req).expect("scan 2");
        assert_eq!(outcome.payload, ScanPayload::Text("second\n".to_string()));
        assert_eq!(
            std::fs::read(root.join("results/alpine.txt")).expect("read"),
            b"second\n"
        );
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn non_zero_exit_is_a_scan_failure_not_a_parse_error() {
        let root = make_temp_dir();
        let fake = Arc::new(FakeRunner::new());
        fake.push_exit(1, "FATAL image scan error");
        let s = scanner(&fake, &root, true);
        let req = ScanRequest::new("ghost:latest", OutputFormat::Json)
            .with_output_file(Some(PathBuf::from("ghost.json")));

        let err = s.scan_image(&req).unwrap_err();
        match err {
            ScanError::NonZeroExit { stderr, .. } => assert_eq!(stderr, "FATAL image scan error"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!root.join("results/ghost.json").exists());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn undecodable_json_is_a_parse_error() {
        let root = make_temp_dir();
        let fake = Arc::new(FakeRunner::new());
        fake.push_ok("Total: 0 (UNKNOWN: 0)");
        let s = scanner(&fake, &root, true);

        let err = s
            .scan_image(&ScanRequest::new("alpine:3", OutputFormat::Json))
            .unwrap_err();
        assert!(matches!(err, ScanError::Parse(_)), "{err:?}");
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn batch_continues_past_failures() {
        let root = make_temp_dir();
        let fake = Arc::new(FakeRunner::new());
        fake.push_exit(1, "no such image")
            .push_ok(REPORT)
            .push_ok("not json");
        let s = scanner(&fake, &root, true);
        let images = vec![
            "ghost:1".to_string(),
            "nginx:latest".to_string(),
            "broken:1".to_string(),
        ];

        let results = s.scan_multiple_images(&images, OutputFormat::Json, &[Severity::Critical]);
        assert_eq!(results.len(), 3);
        assert!(matches!(
            results.get("ghost:1"),
            Some(Err(ScanError::NonZeroExit { .. }))
        ));
        assert!(matches!(results.get("nginx:latest"), Some(Ok(_))));
        assert!(matches!(results.get("broken:1"), Some(Err(ScanError::Parse(_)))));

        let calls = fake.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1].args.last().map(String::as_str), Some("nginx:latest"));
        assert!(calls.iter().all(|c| c.args.contains(&"CRITICAL".to_string())));
        let _ = std::fs::remove_dir_all(&root);
    }
}
