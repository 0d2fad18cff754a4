use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::core::Severity;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Cyclonedx,
    Spdx,
}

impl OutputFormat {
    pub const fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Table => "table",
            OutputFormat::Json => "json",
            OutputFormat::Cyclonedx => "cyclonedx",
            OutputFormat::Spdx => "spdx",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.to_ascii_lowercase().as_str() {
            "table" => Ok(OutputFormat::Table),
            "json" => Ok(OutputFormat::Json),
            "cyclonedx" => Ok(OutputFormat::Cyclonedx),
            "spdx" => Ok(OutputFormat::Spdx),
            _ => Err(format!(
                "invalid format: {s} (expected table|json|cyclonedx|spdx)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VulnType {
    Os,
    Library,
}

impl VulnType {
    pub const fn as_str(self) -> &'static str {
        match self {
            VulnType::Os => "os",
            VulnType::Library => "library",
        }
    }
}

impl fmt::Display for VulnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VulnType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.to_ascii_lowercase().as_str() {
            "os" => Ok(VulnType::Os),
            "library" => Ok(VulnType::Library),
            _ => Err(format!("invalid vulnerability type: {s} (expected os|library)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    pub image: String,
    pub format: OutputFormat,
    pub severities: Vec<Severity>,
    pub vuln_types: Vec<VulnType>,
    /// Relative paths land under the results directory.
    pub output_file: Option<PathBuf>,
}

impl ScanRequest {
    pub fn new(image: impl Into<String>, format: OutputFormat) -> Self {
        Self {
            image: image.into(),
            format,
            severities: Vec::new(),
            vuln_types: Vec::new(),
            output_file: None,
        }
    }

    pub fn with_severities(mut self, severities: impl IntoIterator<Item = Severity>) -> Self {
        self.severities = dedup_sorted(severities);
        self
    }

    pub fn with_vuln_types(mut self, vuln_types: impl IntoIterator<Item = VulnType>) -> Self {
        self.vuln_types = dedup_sorted(vuln_types);
        self
    }

    pub fn with_output_file(mut self, path: Option<PathBuf>) -> Self {
        self.output_file = path;
        self
    }
}

fn dedup_sorted<T: Ord>(items: impl IntoIterator<Item = T>) -> Vec<T> {
    let mut items: Vec<T> = items.into_iter().collect();
    items.sort();
    items.dedup();
    items
}
