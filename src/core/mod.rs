mod image;
mod request;
mod severity;
mod summary;

pub use image::LocalImage;
pub use request::{OutputFormat, ScanRequest, VulnType};
pub use severity::Severity;
pub use summary::VulnerabilitySummary;
