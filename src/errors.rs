use thiserror::Error;
use std::io;
use std::path::PathBuf;

use crate::clinical_metrics::MetricName;
use crate::landmarks::Landmark;

/// Error types for the cephalometric analysis chain
#[derive(Error, Debug)]
pub enum CephError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to read configuration resource {path}: {source}")]
    ConfigRead {
        source: io::Error,
        path: PathBuf,
    },

    #[error("Failed to parse configuration resource {path}: {source}")]
    ConfigLoad {
        source: serde_json::Error,
        path: PathBuf,
    },

    #[error("Invalid configuration resource {path}: {reason}")]
    InvalidResource {
        path: PathBuf,
        reason: String,
    },

    #[error("Image too small: {width}x{height} (minimum {min_dimension}x{min_dimension})")]
    ImageTooSmall {
        width: u32,
        height: u32,
        min_dimension: u32,
    },

    #[error("Required landmark missing: {0}")]
    MissingLandmark(Landmark),

    #[error("Required metric missing: {0}")]
    MissingMetric(MetricName),

    #[error("Required component not initialized: {0}")]
    ComponentMissing(String),

    #[error("CSV output error: {0}")]
    CsvOutput(#[from] csv::Error),

    #[error("JSON output error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid input path: {0}")]
    InvalidPath(PathBuf),
}

impl CephError {
    /// Stable, machine-readable name of the error category.
    pub fn kind(&self) -> &'static str {
        match self {
            CephError::Io(_) => "IoError",
            CephError::Image(_) => "ImageError",
            CephError::Config(_) => "ConfigError",
            CephError::ConfigRead { .. }
            | CephError::ConfigLoad { .. }
            | CephError::InvalidResource { .. } => "ConfigLoadError",
            CephError::ImageTooSmall { .. } => "ImageTooSmallError",
            CephError::MissingLandmark(_) => "MissingLandmarkError",
            CephError::MissingMetric(_) => "MissingMetricError",
            CephError::ComponentMissing(_) => "ComponentMissingError",
            CephError::CsvOutput(_) | CephError::Json(_) => "OutputError",
            CephError::InvalidPath(_) => "InvalidPathError",
        }
    }
}

/// Type alias for Result with our custom error type
pub type Result<T> = std::result::Result<T, CephError>;
