use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::ScanError;
use crate::runtime::{ContainerRuntime, Mount, RunSpec};

const EXTRACT_MOUNT: &str = "/output";

/// Where the distribution image keeps its database tree.
#[derive(Debug, Clone)]
pub struct DistributionImage {
    pub image: String,
    pub database_path: String,
}

/// Stages the scanner database from a distribution image into a local directory.
#[derive(Clone)]
pub struct DatabaseStager {
    runtime: ContainerRuntime,
    source: DistributionImage,
    db_dir: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseMetadata {
    #[serde(rename = "Version", default)]
    pub version: Option<u64>,
    #[serde(rename = "UpdatedAt", default)]
    pub updated_at: Option<String>,
    #[serde(rename = "NextUpdate", default)]
    pub next_update: Option<String>,
    #[serde(rename = "DownloadedAt", default)]
    pub downloaded_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatabaseStatus {
    pub path: String,
    pub present: bool,
    pub files: u64,
    pub bytes: u64,
    pub errors: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<DatabaseMetadata>,
}

/// A directory holds a database iff it exists and has at least one entry.
pub fn has_database(dir: &Path) -> bool {
    match std::fs::read_dir(dir) {
        Ok(mut entries) => entries.next().is_some(),
        Err(_) => false,
    }
}

impl DatabaseStager {
    pub fn new(runtime: ContainerRuntime, source: DistributionImage, db_dir: PathBuf) -> Self {
        Self {
            runtime,
            source,
            db_dir,
        }
    }

    pub fn db_dir(&self) -> &Path {
        &self.db_dir
    }

    /// Pulls the distribution image and copies its database into the local directory.
    ///
    /// Files copied before a failure are left in place.
    pub fn setup(&self) -> Result<(), ScanError> {
        log::info!("Setting up vulnerability database for offline use...");
        create_dir(&self.db_dir)?;
        self.runtime.pull(&self.source.image)?;
        self.extract_into(&self.db_dir)?;
        log::info!("Database setup complete: {}", self.db_dir.display());
        Ok(())
    }

    /// Re-pulls the distribution image and swaps in a freshly extracted database.
    ///
    /// The new tree is extracted next to the live one and only renamed into place
    /// once it is complete. On any failure the previous database stays where it was.
    pub fn update(&self) -> Result<(), ScanError> {
        log::info!("Updating vulnerability database...");
        create_dir(&self.db_dir)?;
        self.runtime.pull(&self.source.image)?;

        let staging = sibling(&self.db_dir, "staging");
        remove_dir_if_exists(&staging)?;
        create_dir(&staging)?;

        if let Err(err) = self.extract_into(&staging) {
            log::error!("Extraction failed, keeping current database: {err}");
            if let Err(cleanup) = remove_dir_if_exists(&staging) {
                log::warn!("{cleanup}");
            }
            return Err(err);
        }
        if !has_database(&staging) {
            remove_dir_if_exists(&staging)?;
            return Err(ScanError::DatabaseMissing { path: staging });
        }

        let previous = sibling(&self.db_dir, "previous");
        if let Err(err) = self.swap_in(&staging, &previous) {
            if let Err(cleanup) = remove_dir_if_exists(&staging) {
                log::warn!("{cleanup}");
            }
            return Err(err);
        }
        discard_previous(&previous);

        log::info!("Database update complete: {}", self.db_dir.display());
        Ok(())
    }

    /// Moves the live tree to `previous` and `staging` into its place.
    fn swap_in(&self, staging: &Path, previous: &Path) -> Result<(), ScanError> {
        remove_dir_if_exists(previous)?;
        std::fs::rename(&self.db_dir, previous)
            .map_err(|e| ScanError::io("failed to move current database aside", &self.db_dir, e))?;
        if let Err(e) = std::fs::rename(staging, &self.db_dir) {
            // Put the old tree back before reporting.
            if let Err(restore) = std::fs::rename(previous, &self.db_dir) {
                log::error!(
                    "failed to restore {} from {}: {restore}",
                    self.db_dir.display(),
                    previous.display()
                );
            }
            return Err(ScanError::io(
                "failed to move staged database into place",
                staging,
                e,
            ));
        }
        Ok(())
    }

    pub fn status(&self) -> DatabaseStatus {
        let mut status = DatabaseStatus {
            path: self.db_dir.display().to_string(),
            present: has_database(&self.db_dir),
            files: 0,
            bytes: 0,
            errors: 0,
            metadata: None,
        };
        if !status.present {
            return status;
        }

        for entry in WalkDir::new(&self.db_dir).follow_links(false) {
            match entry {
                Ok(entry) if entry.file_type().is_file() => match entry.metadata() {
                    Ok(meta) => {
                        status.files = status.files.saturating_add(1);
                        status.bytes = status.bytes.saturating_add(meta.len());
                    }
                    Err(_) => status.errors = status.errors.saturating_add(1),
                },
                Ok(_) => {}
                Err(_) => status.errors = status.errors.saturating_add(1),
            }
        }

        status.metadata = read_metadata(&self.db_dir);
        status
    }

    fn extract_into(&self, dir: &Path) -> Result<(), ScanError> {
        log::info!("Extracting database files into {}...", dir.display());
        let copy = format!(
            "cp -r {}/* {}/",
            self.source.database_path.trim_end_matches('/'),
            EXTRACT_MOUNT
        );
        let spec = RunSpec::new(&self.source.image)
            .mount(Mount::read_write(dir, EXTRACT_MOUNT))
            .args(["sh", "-c", copy.as_str()]);
        let out = self.runtime.run(&spec)?;
        if !out.success() {
            return Err(ScanError::NonZeroExit {
                program: self.runtime.binary().to_string(),
                exit_code: out.exit_code,
                stderr: out.stderr_lossy(),
            });
        }
        Ok(())
    }
}

/// `metadata.json` lives either at the top level or under `db/`.
fn read_metadata(db_dir: &Path) -> Option<DatabaseMetadata> {
    [db_dir.join("metadata.json"), db_dir.join("db/metadata.json")]
        .iter()
        .filter_map(|p| std::fs::read(p).ok())
        .find_map(|buf| serde_json::from_slice(&buf).ok())
}

fn sibling(dir: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = dir
        .file_name()
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| OsString::from("trivy-db"));
    name.push(".");
    name.push(suffix);
    dir.with_file_name(name)
}

fn create_dir(dir: &Path) -> Result<(), ScanError> {
    std::fs::create_dir_all(dir).map_err(|e| ScanError::io("failed to create directory", dir, e))
}

/// The new database is already live; a leftover copy is only worth a warning.
fn discard_previous(previous: &Path) {
    if let Err(err) = remove_dir_if_exists(previous) {
        log::warn!("{err}");
    }
}

fn remove_dir_if_exists(dir: &Path) -> Result<(), ScanError> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ScanError::io("failed to remove directory", dir, e)),
    }
}
