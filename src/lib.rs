// src/lib.rs - Library interface for cephalometric analysis

pub mod classifier;
pub mod clinical_metrics;
pub mod config;
pub mod errors;
pub mod estimator;
pub mod geometry;
pub mod image_io;
pub mod image_utils;
pub mod landmarks;
pub mod norms;
pub mod output;
pub mod pipeline;
pub mod reference_shape;

// Re-export commonly used types and functions
pub use errors::{CephError, Result};
pub use config::Config;
pub use image_io::{InputImage, load_image, get_image_files_in_dir};

// Landmark model and geometry
pub use landmarks::{Landmark, LandmarkSet, Point, LANDMARK_COUNT};
pub use geometry::{angle_at_vertex, angle_between_lines, line_angle, similarity_transform};
pub use reference_shape::ReferenceShape;

// Components
pub use estimator::{Anchors, InferenceMode, LandmarkEstimate, LandmarkEstimator};
pub use clinical_metrics::{
    compute_all,
    validate_landmarks,
    ClinicalMetric,
    MetricName,
    MetricStatus,
    MetricValues,
    MetricsReport,
    NormalRange,
    NormalRangeConfig,
};
pub use norms::{AgeGroup, Sex};
pub use classifier::{
    ClassificationResult,
    MalocclusionClass,
    MalocclusionClassifier,
    PatientMetadata,
};

// Orchestration
pub use pipeline::{
    CephalometricPipeline,
    PipelineError,
    PipelineResult,
    QualitySummary,
    RunStatistics,
};
