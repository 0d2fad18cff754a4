use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub paths: PathsConfig,
    pub runtime: RuntimeConfig,
    pub images: ImagesConfig,
    pub ui: UiConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PathsConfig {
    pub data_dir: PathBuf,
    pub db_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub results_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeConfig {
    pub binary: String,
    pub socket: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImagesConfig {
    pub scanner: String,
    pub database: String,
    pub database_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UiConfig {
    pub color: bool,
}

impl RuntimeConfig {
    pub fn timeout(&self) -> Option<Duration> {
        if self.timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.timeout_secs))
        }
    }
}

impl PathsConfig {
    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Creates the database, cache and results directories if absent.
    pub fn ensure(&self) -> Result<()> {
        for dir in [&self.db_dir, &self.cache_dir, &self.results_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create directory: {}", dir.display()))?;
        }
        Ok(())
    }
}

impl EffectiveConfig {
    pub fn defaults(home_dir: &Path) -> Self {
        let data_dir = default_data_dir(home_dir);
        Self {
            paths: PathsConfig {
                db_dir: data_dir.join("trivy-db"),
                cache_dir: data_dir.join("trivy-cache"),
                results_dir: data_dir.join("scan-results"),
                data_dir,
            },
            runtime: RuntimeConfig {
                binary: "docker".to_string(),
                socket: "/var/run/docker.sock".to_string(),
                timeout_secs: 1800,
            },
            images: ImagesConfig {
                scanner: "aquasec/trivy:latest".to_string(),
                database: "aquasec/trivy-db:latest".to_string(),
                database_path: "/trivy-db".to_string(),
            },
            ui: UiConfig { color: true },
            config_path: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    paths: Option<RawPathsConfig>,
    runtime: Option<RawRuntimeConfig>,
    images: Option<RawImagesConfig>,
    ui: Option<RawUiConfig>,
}

#[derive(Debug, Deserialize)]
struct RawPathsConfig {
    data_dir: Option<String>,
    db_dir: Option<String>,
    cache_dir: Option<String>,
    results_dir: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRuntimeConfig {
    binary: Option<String>,
    socket: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawImagesConfig {
    scanner: Option<String>,
    database: Option<String>,
    database_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawUiConfig {
    color: Option<bool>,
}

/// Directories set explicitly; anything left `None` follows `data_dir`.
#[derive(Debug, Default)]
struct DirOverrides {
    db_dir: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
    results_dir: Option<PathBuf>,
}

pub fn default_config_path(home_dir: &Path) -> PathBuf {
    home_dir.join(".config/trivy-offline/config.toml")
}

pub fn default_data_dir(home_dir: &Path) -> PathBuf {
    home_dir.join(".local/share/trivy-offline")
}

pub fn load(config_path: Option<&Path>, home_dir: &Path) -> Result<EffectiveConfig> {
    let mut cfg = EffectiveConfig::defaults(home_dir);
    let mut dirs = DirOverrides::default();

    let path = config_path
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| default_config_path(home_dir));

    if path.exists() {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let raw: RawConfig = toml::from_str(&s).context("failed to parse config file (TOML)")?;
        apply_raw_config(&mut cfg, &mut dirs, raw, home_dir);
        cfg.config_path = Some(path.display().to_string());
    } else if config_path.is_some() {
        anyhow::bail!("config file not found: {}", path.display());
    }

    apply_env_overrides(&mut cfg, &mut dirs, home_dir)?;

    let data_dir = cfg.paths.data_dir.clone();
    cfg.paths.db_dir = dirs.db_dir.unwrap_or_else(|| data_dir.join("trivy-db"));
    cfg.paths.cache_dir = dirs.cache_dir.unwrap_or_else(|| data_dir.join("trivy-cache"));
    cfg.paths.results_dir = dirs
        .results_dir
        .unwrap_or_else(|| data_dir.join("scan-results"));

    Ok(cfg)
}

fn apply_raw_config(
    cfg: &mut EffectiveConfig,
    dirs: &mut DirOverrides,
    raw: RawConfig,
    home_dir: &Path,
) {
    if let Some(paths) = raw.paths {
        if let Some(data_dir) = paths.data_dir {
            cfg.paths.data_dir = expand_home(&data_dir, home_dir);
        }
        if let Some(db_dir) = paths.db_dir {
            dirs.db_dir = Some(expand_home(&db_dir, home_dir));
        }
        if let Some(cache_dir) = paths.cache_dir {
            dirs.cache_dir = Some(expand_home(&cache_dir, home_dir));
        }
        if let Some(results_dir) = paths.results_dir {
            dirs.results_dir = Some(expand_home(&results_dir, home_dir));
        }
    }

    if let Some(runtime) = raw.runtime {
        if let Some(binary) = runtime.binary {
            cfg.runtime.binary = binary;
        }
        if let Some(socket) = runtime.socket {
            cfg.runtime.socket = socket;
        }
        if let Some(timeout_secs) = runtime.timeout_secs {
            cfg.runtime.timeout_secs = timeout_secs;
        }
    }

    if let Some(images) = raw.images {
        if let Some(scanner) = images.scanner {
            cfg.images.scanner = scanner;
        }
        if let Some(database) = images.database {
            cfg.images.database = database;
        }
        if let Some(database_path) = images.database_path {
            cfg.images.database_path = database_path;
        }
    }

    if let Some(ui) = raw.ui {
        if let Some(color) = ui.color {
            cfg.ui.color = color;
        }
    }
}

fn apply_env_overrides(
    cfg: &mut EffectiveConfig,
    dirs: &mut DirOverrides,
    home_dir: &Path,
) -> Result<()> {
    if let Some(v) = env_non_empty("TRIVY_OFFLINE_DATA_DIR") {
        cfg.paths.data_dir = expand_home(&v, home_dir);
    }
    if let Some(v) = env_non_empty("TRIVY_OFFLINE_DB_DIR") {
        dirs.db_dir = Some(expand_home(&v, home_dir));
    }
    if let Some(v) = env_non_empty("TRIVY_OFFLINE_CACHE_DIR") {
        dirs.cache_dir = Some(expand_home(&v, home_dir));
    }
    if let Some(v) = env_non_empty("TRIVY_OFFLINE_RESULTS_DIR") {
        dirs.results_dir = Some(expand_home(&v, home_dir));
    }
    if let Some(v) = env_non_empty("TRIVY_OFFLINE_RUNTIME") {
        cfg.runtime.binary = v;
    }
    if let Some(v) = env_non_empty("TRIVY_OFFLINE_SOCKET") {
        cfg.runtime.socket = v;
    }
    if let Ok(v) = std::env::var("TRIVY_OFFLINE_TIMEOUT") {
        cfg.runtime.timeout_secs = v
            .trim()
            .parse::<u64>()
            .with_context(|| "TRIVY_OFFLINE_TIMEOUT")?;
    }
    if let Some(v) = env_non_empty("TRIVY_OFFLINE_SCANNER_IMAGE") {
        cfg.images.scanner = v;
    }
    if let Some(v) = env_non_empty("TRIVY_OFFLINE_DB_IMAGE") {
        cfg.images.database = v;
    }
    if let Ok(v) = std::env::var("TRIVY_OFFLINE_UI_COLOR") {
        cfg.ui.color = parse_bool(&v).with_context(|| "TRIVY_OFFLINE_UI_COLOR")?;
    }

    Ok(())
}

fn env_non_empty(key: &str) -> Option<String> {
    let v = std::env::var(key).ok()?;
    let v = v.trim();
    if v.is_empty() {
        None
    } else {
        Some(v.to_string())
    }
}

fn expand_home(s: &str, home_dir: &Path) -> PathBuf {
    if s == "~" {
        return home_dir.to_path_buf();
    }
    match s.strip_prefix("~/") {
        Some(rest) => home_dir.join(rest),
        None => PathBuf::from(s),
    }
}

fn parse_bool(s: &str) -> Result<bool> {
    let s = s.trim().to_ascii_lowercase();
    match s.as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow::anyhow!(
            "invalid boolean: {s} (expected true|false|1|0|yes|no|on|off)"
        )),
    }
}
