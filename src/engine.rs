use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::config::EffectiveConfig;
use crate::core::{LocalImage, OutputFormat, ScanRequest, Severity};
use crate::db::{DatabaseStager, DatabaseStatus, DistributionImage};
use crate::error::ScanError;
use crate::platform::{CommandRunner, SystemRunner};
use crate::runtime::ContainerRuntime;
use crate::scanner::{BatchResults, ScanOutcome, Scanner, ScannerPaths};

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub timeout: Option<Duration>,
    pub show_progress: bool,
}

/// Wires the components together around one runtime client.
#[derive(Clone)]
pub struct Engine {
    opts: EngineOptions,
    runtime: ContainerRuntime,
    stager: DatabaseStager,
    scanner: Scanner,
}

impl Engine {
    pub fn new(cfg: &EffectiveConfig, opts: EngineOptions) -> Result<Self> {
        Self::with_runner(cfg, opts, Arc::new(SystemRunner))
    }

    pub fn with_runner(
        cfg: &EffectiveConfig,
        opts: EngineOptions,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        cfg.paths.ensure()?;

        let runtime = ContainerRuntime::new(runner, cfg.runtime.binary.clone(), opts.timeout);
        let stager = DatabaseStager::new(
            runtime.clone(),
            DistributionImage {
                image: cfg.images.database.clone(),
                database_path: cfg.images.database_path.clone(),
            },
            cfg.paths.db_dir.clone(),
        );
        let scanner = Scanner::new(
            runtime.clone(),
            cfg.images.scanner.clone(),
            cfg.runtime.socket.clone(),
            ScannerPaths {
                db_dir: cfg.paths.db_dir.clone(),
                cache_dir: cfg.paths.cache_dir.clone(),
                results_dir: cfg.paths.results_dir.clone(),
            },
        );

        Ok(Self {
            opts,
            runtime,
            stager,
            scanner,
        })
    }

    pub fn setup(&self) -> Result<(), ScanError> {
        self.with_spinner("Setting up database...", || self.stager.setup())
    }

    pub fn update(&self) -> Result<(), ScanError> {
        self.with_spinner("Updating database...", || self.stager.update())
    }

    pub fn status(&self) -> DatabaseStatus {
        self.stager.status()
    }

    pub fn scan(&self, req: &ScanRequest) -> Result<ScanOutcome, ScanError> {
        self.with_spinner(&format!("Scanning {}...", req.image), || {
            self.scanner.scan_image(req)
        })
    }

    pub fn scan_many(
        &self,
        images: &[String],
        format: OutputFormat,
        severities: &[Severity],
    ) -> BatchResults {
        self.with_spinner(&format!("Scanning {} images...", images.len()), || {
            self.scanner.scan_multiple_images(images, format, severities)
        })
    }

    pub fn list_images(&self) -> Vec<LocalImage> {
        crate::inventory::list_local_images(&self.runtime)
    }

    fn with_spinner<T>(&self, message: &str, f: impl FnOnce() -> T) -> T {
        use std::io::IsTerminal;
        let progress_enabled = self.opts.show_progress && std::io::stderr().is_terminal();
        let pb = if progress_enabled {
            let pb = indicatif::ProgressBar::new_spinner();
            pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
            pb.set_message(message.to_string());
            pb.enable_steady_tick(Duration::from_millis(120));
            Some(pb)
        } else {
            None
        };

        let out = f();

        if let Some(pb) = pb {
            pb.finish_and_clear();
        }
        out
    }
}
