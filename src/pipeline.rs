// src/pipeline.rs - Orchestrates estimation, metrics and classification for one image

use chrono::Local;
use image::DynamicImage;
use log::{debug, error, info, warn};
use rayon::prelude::*;
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::classifier::{
    ClassificationResult, ClassifierInfo, MalocclusionClassifier, PatientMetadata,
};
use crate::clinical_metrics::{compute_all, MetricsReport, NormalRangeConfig};
use crate::config::Config;
use crate::errors::{CephError, Result};
use crate::estimator::{Adjustment, Anchors, EstimatorInfo, InferenceMode, LandmarkEstimator};
use crate::image_io::{load_image, output_name};
use crate::landmarks::{LandmarkSet, LANDMARK_COUNT};

pub const PIPELINE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const STAGE_LOAD: &str = "load";
pub const STAGE_INIT: &str = "init";
pub const STAGE_PREPROCESS: &str = "preprocess";
pub const STAGE_INFERENCE: &str = "inference";
pub const STAGE_METRICS: &str = "metrics";
pub const STAGE_CLASSIFICATION: &str = "classification";

/// Kind reported when a stage panics instead of returning an error.
pub const INTERNAL_ERROR_KIND: &str = "InternalError";

const STATS_ALPHA: f64 = 0.1;

/// Structured failure record of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineError {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub stage: String,
}

impl PipelineError {
    pub fn new(err: &CephError, stage: &str) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            stage: stage.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub color_mode: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LandmarkSummary {
    pub count: usize,
    pub inference_mode: InferenceMode,
    pub content_hash: String,
    pub adjustments: Vec<Adjustment>,
    pub coordinates: LandmarkSet,
}

/// Stage durations in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Timing {
    pub preprocess_ms: f64,
    pub inference_ms: f64,
    pub metrics_ms: f64,
    pub classification_ms: f64,
    pub total_ms: f64,
}

fn millis(duration: Duration) -> f64 {
    (duration.as_secs_f64() * 1000.0 * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ComponentScores {
    pub landmarks: f64,
    pub metrics: f64,
    pub classification: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualitySummary {
    pub overall_score: f64,
    pub component_scores: ComponentScores,
    pub warnings: Vec<String>,
    pub recommendation: String,
}

/// Score a completed run: landmark completeness, share of abnormal metrics
/// and classification confidence, weighted 0.3 / 0.3 / 0.4.
pub fn summarize_quality(
    landmarks: &LandmarkSet,
    metrics: &MetricsReport,
    classification: &ClassificationResult,
) -> QualitySummary {
    let mut warnings = Vec::new();

    let present = landmarks.len();
    let mut landmark_score: f64 = 1.0;
    if present < LANDMARK_COUNT {
        landmark_score -= 0.1 * (LANDMARK_COUNT - present) as f64;
        warnings.push(format!("Missing landmarks ({}/{})", present, LANDMARK_COUNT));
    }

    let abnormal = metrics.abnormal_count();
    let mut metric_score: f64 = 1.0;
    if abnormal >= 3 {
        metric_score -= 0.2;
        warnings.push(format!("Multiple abnormal metrics ({})", abnormal));
    }

    let confidence = classification.confidence;
    if confidence < 0.7 {
        warnings.push(format!("Low classification confidence ({:.1}%)", confidence * 100.0));
    }

    let scores = ComponentScores {
        landmarks: landmark_score.clamp(0.0, 1.0),
        metrics: metric_score.clamp(0.0, 1.0),
        classification: confidence.clamp(0.0, 1.0),
    };
    let overall = scores.landmarks * 0.3 + scores.metrics * 0.3 + scores.classification * 0.4;
    let overall = overall.clamp(0.0, 1.0);

    QualitySummary {
        overall_score: (overall * 1000.0).round() / 1000.0,
        component_scores: scores,
        warnings,
        recommendation: recommendation(overall).to_string(),
    }
}

fn recommendation(score: f64) -> &'static str {
    if score >= 0.9 {
        "Excellent analysis result."
    } else if score >= 0.7 {
        "Good analysis result."
    } else if score >= 0.5 {
        "Review the analysis result carefully."
    } else {
        "Low confidence result. Check image quality and landmark positions."
    }
}

/// Everything a successful run produces.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Analysis {
    pub image_info: ImageInfo,
    pub anchors_used: bool,
    pub landmarks: LandmarkSummary,
    pub clinical_metrics: MetricsReport,
    pub classification: ClassificationResult,
    pub timing: Timing,
    pub quality: QualitySummary,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Analysis(Box<Analysis>),
    Error(PipelineError),
}

/// Top-level record of one run. Either fully populated or a failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineResult {
    pub run_id: String,
    pub timestamp: String,
    pub seed: u64,
    pub metadata: PatientMetadata,
    pub success: bool,
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl PipelineResult {
    /// Failure record for an input that never reached the pipeline, such as
    /// an unreadable file in a batch.
    pub fn failed(
        run_id: &str,
        seed: u64,
        metadata: PatientMetadata,
        error: PipelineError,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            timestamp: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            seed,
            metadata,
            success: false,
            outcome: Outcome::Error(error),
        }
    }

    pub fn analysis(&self) -> Option<&Analysis> {
        match &self.outcome {
            Outcome::Analysis(analysis) => Some(analysis),
            Outcome::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&PipelineError> {
        match &self.outcome {
            Outcome::Analysis(_) => None,
            Outcome::Error(err) => Some(err),
        }
    }
}

/// Process-wide run counters, updated after every successful run.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct RunStatistics {
    pub total_runs: u64,
    pub last_run_ms: Option<f64>,
    pub average_run_ms: f64,
}

impl RunStatistics {
    /// Exponential moving average; the first run seeds the average.
    pub fn record(&mut self, run_ms: f64) {
        self.total_runs += 1;
        self.last_run_ms = Some(run_ms);
        if self.total_runs == 1 {
            self.average_run_ms = run_ms;
        } else {
            self.average_run_ms = STATS_ALPHA * run_ms + (1.0 - STATS_ALPHA) * self.average_run_ms;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineInfo {
    pub pipeline: &'static str,
    pub version: &'static str,
    pub seed: u64,
    pub config_dir: PathBuf,
    pub estimator: Option<EstimatorInfo>,
    pub classifier: ClassifierInfo,
    pub init_error: Option<PipelineError>,
    pub statistics: RunStatistics,
}

/// Validate the image size and convert to RGB.
pub fn preprocess_image(image: &DynamicImage, min_dimension: u32) -> Result<DynamicImage> {
    let (width, height) = (image.width(), image.height());
    if width < min_dimension || height < min_dimension {
        return Err(CephError::ImageTooSmall { width, height, min_dimension });
    }
    Ok(DynamicImage::ImageRgb8(image.to_rgb8()))
}

/// Estimator -> metrics -> classifier, with timing and quality scoring.
pub struct CephalometricPipeline {
    config: Config,
    config_dir: PathBuf,
    estimator: Option<LandmarkEstimator>,
    normal_ranges: Option<NormalRangeConfig>,
    classifier: MalocclusionClassifier,
    init_error: Option<PipelineError>,
    stats: Mutex<RunStatistics>,
}

impl CephalometricPipeline {
    /// Build the pipeline. Never fails: a component that cannot be loaded is
    /// reported by every subsequent `run`.
    pub fn new(config: Config) -> Self {
        let config_dir = config.resolved_config_dir();
        if !config_dir.is_dir() {
            warn!("Clinical standards directory does not exist: {}", config_dir.display());
        }

        let loaded = config.validate().and_then(|_| {
            let estimator = LandmarkEstimator::from_config(&config)?;
            let normal_ranges = NormalRangeConfig::load(
                config.normal_ranges_path(),
                config.allow_default_normal_ranges,
            )?;
            Ok((estimator, normal_ranges))
        });

        let (estimator, normal_ranges, init_error) = match loaded {
            Ok((estimator, normal_ranges)) => (Some(estimator), Some(normal_ranges), None),
            Err(e) => {
                error!("Pipeline component initialization failed: {}", e);
                (None, None, Some(PipelineError::new(&e, STAGE_INIT)))
            }
        };

        let classifier = MalocclusionClassifier::new(config.seed);
        info!(
            "Cephalometric pipeline initialized (seed={}, config dir '{}')",
            config.seed,
            config_dir.display()
        );

        Self {
            config,
            config_dir,
            estimator,
            normal_ranges,
            classifier,
            init_error,
            stats: Mutex::new(RunStatistics::default()),
        }
    }

    /// Assemble a pipeline from already constructed components.
    pub fn from_components(
        config: Config,
        estimator: LandmarkEstimator,
        normal_ranges: NormalRangeConfig,
        classifier: MalocclusionClassifier,
    ) -> Self {
        let config_dir = config.resolved_config_dir();
        Self {
            config,
            config_dir,
            estimator: Some(estimator),
            normal_ranges: Some(normal_ranges),
            classifier,
            init_error: None,
            stats: Mutex::new(RunStatistics::default()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The classifier, for recomputing a classification from edited metrics.
    pub fn classifier(&self) -> &MalocclusionClassifier {
        &self.classifier
    }

    pub fn is_ready(&self) -> bool {
        self.init_error.is_none() && self.estimator.is_some() && self.normal_ranges.is_some()
    }

    pub fn statistics(&self) -> RunStatistics {
        *self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run the full chain on one image. Always returns a result record.
    pub fn run(
        &self,
        image: &DynamicImage,
        metadata: &PatientMetadata,
        anchors: Option<&Anchors>,
        run_id: Option<&str>,
    ) -> PipelineResult {
        let run_id = match run_id {
            Some(id) => id.to_string(),
            None => Uuid::new_v4().simple().to_string()[..8].to_string(),
        };
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();

        let attempt = AssertUnwindSafe(|| self.analyze(image, metadata, anchors));
        let outcome = match panic::catch_unwind(attempt) {
            Ok(Ok(analysis)) => {
                self.stats
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .record(analysis.timing.total_ms);
                info!(
                    "Run {} completed: {} ({:.1}% confidence) in {:.1} ms",
                    run_id,
                    analysis.classification.predicted_class,
                    analysis.classification.confidence * 100.0,
                    analysis.timing.total_ms
                );
                Outcome::Analysis(Box::new(analysis))
            }
            Ok(Err(err)) => {
                error!("Run {} failed at {}: {}", run_id, err.stage, err.message);
                Outcome::Error(err)
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!("Run {} panicked: {}", run_id, message);
                Outcome::Error(PipelineError {
                    kind: INTERNAL_ERROR_KIND.to_string(),
                    message,
                    stage: "unknown".to_string(),
                })
            }
        };

        PipelineResult {
            run_id,
            timestamp,
            seed: self.config.seed,
            metadata: *metadata,
            success: matches!(outcome, Outcome::Analysis(_)),
            outcome,
        }
    }

    fn components(
        &self,
    ) -> std::result::Result<(&LandmarkEstimator, &NormalRangeConfig), PipelineError> {
        if let Some(err) = &self.init_error {
            return Err(err.clone());
        }
        let estimator = self.estimator.as_ref().ok_or_else(|| {
            let err = CephError::ComponentMissing("landmark estimator".to_string());
            PipelineError::new(&err, STAGE_INIT)
        })?;
        let normal_ranges = self.normal_ranges.as_ref().ok_or_else(|| {
            let err = CephError::ComponentMissing("normal range table".to_string());
            PipelineError::new(&err, STAGE_INIT)
        })?;
        Ok((estimator, normal_ranges))
    }

    fn analyze(
        &self,
        image: &DynamicImage,
        metadata: &PatientMetadata,
        anchors: Option<&Anchors>,
    ) -> std::result::Result<Analysis, PipelineError> {
        let (estimator, normal_ranges) = self.components()?;

        let start = Instant::now();
        let rgb = preprocess_image(image, self.config.min_image_dimension)
            .map_err(|e| PipelineError::new(&e, STAGE_PREPROCESS))?;
        let preprocessed = Instant::now();
        debug!("Preprocessed {}x{} image", rgb.width(), rgb.height());

        let estimate = estimator.estimate(&rgb, anchors);
        if let Some(&missing) = estimate.landmarks.missing().first() {
            return Err(PipelineError::new(&CephError::MissingLandmark(missing), STAGE_INFERENCE));
        }
        debug!("Landmarks placed in {} mode", estimate.mode.as_str());
        let inferred = Instant::now();

        let metrics = compute_all(&estimate.landmarks, normal_ranges)
            .map_err(|e| PipelineError::new(&e, STAGE_METRICS))?;
        let measured = Instant::now();
        debug!(
            "Metrics: SNA {:.2}, SNB {:.2}, ANB {:.2}, FMA {:.2}",
            metrics.sna.value, metrics.snb.value, metrics.anb.value, metrics.fma.value
        );

        let classification = self
            .classifier
            .classify_report(&metrics, metadata)
            .map_err(|e| PipelineError::new(&e, STAGE_CLASSIFICATION))?;
        let classified = Instant::now();

        let timing = Timing {
            preprocess_ms: millis(preprocessed - start),
            inference_ms: millis(inferred - preprocessed),
            metrics_ms: millis(measured - inferred),
            classification_ms: millis(classified - measured),
            total_ms: millis(classified - start),
        };

        let quality = summarize_quality(&estimate.landmarks, &metrics, &classification);
        debug!("Quality {:.3}: {}", quality.overall_score, quality.recommendation);

        Ok(Analysis {
            image_info: ImageInfo { width: rgb.width(), height: rgb.height(), color_mode: "RGB" },
            anchors_used: anchors.is_some(),
            landmarks: LandmarkSummary {
                count: estimate.landmarks.len(),
                inference_mode: estimate.mode,
                content_hash: estimate.content_hash,
                adjustments: estimate.adjustments,
                coordinates: estimate.landmarks,
            },
            clinical_metrics: metrics,
            classification,
            timing,
            quality,
        })
    }

    /// Run every item, in parallel when configured. Results keep input order
    /// and carry ids `batch_001`, `batch_002`, ...
    pub fn run_batch(&self, items: &[(DynamicImage, PatientMetadata)]) -> Vec<PipelineResult> {
        let batch_start = Instant::now();
        let total = items.len();
        info!("Batch processing started: {} images", total);

        let process = |(index, (image, metadata)): (usize, &(DynamicImage, PatientMetadata))| {
            let run_id = format!("batch_{:03}", index + 1);
            let result = self.run(image, metadata, None, Some(&run_id));
            match result.error() {
                None => debug!("{}/{} done", index + 1, total),
                Some(err) => warn!("{}/{} failed: {}", index + 1, total, err.message),
            }
            result
        };

        let results: Vec<PipelineResult> = if self.config.use_parallel {
            items.par_iter().enumerate().map(process).collect()
        } else {
            items.iter().enumerate().map(process).collect()
        };

        let failed = results.iter().filter(|r| !r.success).count();
        info!(
            "Batch processing finished: {} ok, {} failed in {:.2}s",
            total - failed,
            failed,
            batch_start.elapsed().as_secs_f64()
        );
        results
    }

    /// Load and run every file, keeping file order. Each entry is named by
    /// its path relative to `root`. A file that cannot be loaded gets a failed
    /// entry at stage `load` instead of being dropped.
    pub fn run_files(
        &self,
        files: &[PathBuf],
        root: &Path,
        metadata: &PatientMetadata,
    ) -> Vec<(String, PipelineResult)> {
        let mut names = Vec::with_capacity(files.len());
        let mut load_failures = Vec::with_capacity(files.len());
        let mut items = Vec::new();

        for (index, path) in files.iter().enumerate() {
            names.push(output_name(path, root));
            match load_image(path) {
                Ok(input) => {
                    items.push((input.image, *metadata));
                    load_failures.push(None);
                }
                Err(e) => {
                    error!("Error loading {}: {}", path.display(), e);
                    let run_id = format!("load_{:03}", index + 1);
                    let err = PipelineError::new(&e, STAGE_LOAD);
                    let failed = PipelineResult::failed(&run_id, self.config.seed, *metadata, err);
                    load_failures.push(Some(failed));
                }
            }
        }

        let mut batch = self.run_batch(&items).into_iter();
        names
            .into_iter()
            .zip(load_failures)
            .filter_map(|(name, failed)| {
                let result = match failed {
                    Some(failed) => failed,
                    None => batch.next()?,
                };
                Some((name, result))
            })
            .collect()
    }

    pub fn pipeline_info(&self) -> PipelineInfo {
        PipelineInfo {
            pipeline: "CephalometricPipeline",
            version: PIPELINE_VERSION,
            seed: self.config.seed,
            config_dir: self.config_dir.clone(),
            estimator: self.estimator.as_ref().map(LandmarkEstimator::info),
            classifier: self.classifier.info(),
            init_error: self.init_error.clone(),
            statistics: self.statistics(),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "stage panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::MalocclusionClass;
    use crate::norms::Sex;
    use crate::clinical_metrics::MetricStatus;
    use crate::estimator::EstimatorOptions;
    use crate::landmarks::{Landmark, Point};
    use crate::reference_shape::ReferenceShape;
    use assert_approx_eq::assert_approx_eq;
    use image::{Rgb, RgbImage};

    fn template() -> LandmarkSet {
        [
            (Landmark::N, 0.585, 0.192),
            (Landmark::S, 0.425, 0.315),
            (Landmark::Ar, 0.385, 0.445),
            (Landmark::Or, 0.515, 0.318),
            (Landmark::Po, 0.345, 0.355),
            (Landmark::A, 0.635, 0.485),
            (Landmark::B, 0.605, 0.625),
            (Landmark::U1, 0.667, 0.528),
            (Landmark::Ls, 0.725, 0.515),
            (Landmark::SoftPog, 0.735, 0.695),
            (Landmark::Go, 0.405, 0.605),
            (Landmark::Pog, 0.655, 0.665),
            (Landmark::Me, 0.605, 0.705),
            (Landmark::Ans, 0.645, 0.465),
            (Landmark::Pns, 0.485, 0.475),
            (Landmark::Gn, 0.625, 0.695),
            (Landmark::L1, 0.645, 0.585),
            (Landmark::Li, 0.695, 0.585),
            (Landmark::Pn, 0.755, 0.455),
        ]
        .into_iter()
        .map(|(l, x, y)| (l, Point::new(x, y)))
        .collect()
    }

    fn estimator(options: EstimatorOptions) -> LandmarkEstimator {
        let mut canonical = ReferenceShape::new(template());
        canonical.content_hash = Some("0".repeat(64));
        LandmarkEstimator::new(canonical, ReferenceShape::new(template()), options)
    }

    fn pipeline(config: Config) -> CephalometricPipeline {
        let estimator = estimator(EstimatorOptions::from(&config));
        let seed = config.seed;
        CephalometricPipeline::from_components(
            config,
            estimator,
            NormalRangeConfig::builtin(),
            MalocclusionClassifier::new(seed),
        )
    }

    /// A NaN clamp margin makes `f64::clamp` panic inside the estimator.
    fn panicking_pipeline(config: Config) -> CephalometricPipeline {
        let options = EstimatorOptions {
            clamp_margin_px: f64::NAN,
            ..EstimatorOptions::from(&config)
        };
        let seed = config.seed;
        CephalometricPipeline::from_components(
            config,
            estimator(options),
            NormalRangeConfig::builtin(),
            MalocclusionClassifier::new(seed),
        )
    }

    fn radiograph(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            let v = ((x / 8 + y / 8) % 2 * 120 + 60) as u8;
            Rgb([v, v, v])
        }))
    }

    #[test]
    fn quality_summary_tiers() {
        let p = pipeline(Config::default());
        let result = p.run(&radiograph(400, 300), &PatientMetadata::default(), None, Some("q"));
        let analysis = result.analysis().unwrap();

        let mut landmarks = analysis.landmarks.coordinates.clone();
        landmarks.remove(Landmark::Pn);
        landmarks.remove(Landmark::Li);
        let q = summarize_quality(&landmarks, &analysis.clinical_metrics, &analysis.classification);
        assert_approx_eq!(q.component_scores.landmarks, 0.8, 1e-12);
        assert!(q.warnings.iter().any(|w| w == "Missing landmarks (17/19)"));

        let confidence = analysis.classification.confidence;
        let expected = 0.8 * 0.3 + q.component_scores.metrics * 0.3 + confidence * 0.4;
        assert_approx_eq!(q.overall_score, (expected * 1000.0).round() / 1000.0, 1e-12);
    }

    #[test]
    fn many_abnormal_metrics_are_penalized() {
        let p = pipeline(Config::default());
        let result = p.run(&radiograph(400, 300), &PatientMetadata::default(), None, None);
        let analysis = result.analysis().unwrap();

        let mut metrics = analysis.clinical_metrics.clone();
        metrics.sna.status = MetricStatus::High;
        metrics.snb.status = MetricStatus::Low;
        metrics.fma.status = MetricStatus::High;
        let landmarks = &analysis.landmarks.coordinates;
        let q = summarize_quality(landmarks, &metrics, &analysis.classification);
        assert_approx_eq!(q.component_scores.metrics, 0.8, 1e-12);
        assert!(q.warnings.iter().any(|w| w.starts_with("Multiple abnormal metrics")));
    }

    #[test]
    fn recommendation_thresholds() {
        assert_eq!(recommendation(0.95), "Excellent analysis result.");
        assert_eq!(recommendation(0.9), "Excellent analysis result.");
        assert_eq!(recommendation(0.75), "Good analysis result.");
        assert_eq!(recommendation(0.5), "Review the analysis result carefully.");
        assert!(recommendation(0.2).starts_with("Low confidence"));
    }

    #[test]
    fn statistics_moving_average() {
        let mut stats = RunStatistics::default();
        stats.record(100.0);
        assert_eq!(stats.average_run_ms, 100.0);
        stats.record(200.0);
        assert_approx_eq!(stats.average_run_ms, 110.0, 1e-9);
        assert_eq!(stats.total_runs, 2);
        assert_eq!(stats.last_run_ms, Some(200.0));
    }

    #[test]
    fn too_small_image_fails_in_preprocess() {
        let p = pipeline(Config::default());
        let result = p.run(&radiograph(50, 50), &PatientMetadata::default(), None, Some("small"));
        assert!(!result.success);
        let err = result.error().unwrap();
        assert_eq!(err.kind, "ImageTooSmallError");
        assert_eq!(err.stage, STAGE_PREPROCESS);
        assert_eq!(p.statistics().total_runs, 0);
    }

    #[test]
    fn successful_run_is_complete() {
        let p = pipeline(Config::default());
        let meta = PatientMetadata::default();
        let result = p.run(&radiograph(640, 480), &meta, None, Some("abc"));
        assert!(result.success);
        assert_eq!(result.run_id, "abc");

        let analysis = result.analysis().unwrap();
        assert_eq!(analysis.landmarks.count, LANDMARK_COUNT);
        assert_eq!(analysis.landmarks.inference_mode, InferenceMode::AdaptiveHeuristic);
        assert_eq!(analysis.image_info, ImageInfo { width: 640, height: 480, color_mode: "RGB" });
        assert!(!analysis.anchors_used);
        assert_eq!(
            analysis.clinical_metrics.anb.value,
            analysis.clinical_metrics.sna.value - analysis.clinical_metrics.snb.value
        );
        assert!(MalocclusionClass::ALL.contains(&analysis.classification.predicted_class));
        assert_eq!(p.statistics().total_runs, 1);
    }

    #[test]
    fn generated_run_ids_are_short() {
        let p = pipeline(Config::default());
        let result = p.run(&radiograph(200, 200), &PatientMetadata::default(), None, None);
        assert_eq!(result.run_id.len(), 8);
    }

    #[test]
    fn init_failure_is_reported_on_every_run() {
        if std::env::var(crate::config::DATA_DIR_ENV).is_ok() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let p = CephalometricPipeline::new(Config {
            config_dir: dir.path().join("missing").to_string_lossy().into_owned(),
            ..Config::default()
        });

        assert!(!p.is_ready());
        for _ in 0..2 {
            let result = p.run(&radiograph(200, 200), &PatientMetadata::default(), None, None);
            let err = result.error().unwrap();
            assert_eq!(err.kind, "ConfigLoadError");
            assert_eq!(err.stage, STAGE_INIT);
        }
        assert!(p.pipeline_info().init_error.is_some());
        assert!(p.pipeline_info().estimator.is_none());
    }

    #[test]
    fn stage_panic_is_reported_as_internal_error() {
        let mut p = panicking_pipeline(Config::default());
        let meta = PatientMetadata::default();

        for id in ["first", "second"] {
            let result = p.run(&radiograph(300, 300), &meta, None, Some(id));
            assert!(!result.success);
            assert_eq!(result.run_id, id);
            let err = result.error().unwrap();
            assert_eq!(err.kind, INTERNAL_ERROR_KIND);
            assert_eq!(err.stage, "unknown");
            assert!(!err.message.is_empty());
        }
        assert_eq!(p.statistics().total_runs, 0);

        p.estimator = Some(estimator(EstimatorOptions::from(&Config::default())));
        let result = p.run(&radiograph(300, 300), &meta, None, Some("third"));
        assert!(result.success);
        assert_eq!(p.statistics().total_runs, 1);
    }

    #[test]
    fn panicking_batch_item_does_not_abort_the_batch() {
        for use_parallel in [true, false] {
            let p = panicking_pipeline(Config { use_parallel, ..Config::default() });
            let items = vec![
                (radiograph(50, 50), PatientMetadata::default()),
                (radiograph(300, 300), PatientMetadata::default()),
                (radiograph(40, 400), PatientMetadata::new(30, Sex::Male)),
            ];

            let results = p.run_batch(&items);
            assert_eq!(results.len(), 3);
            let kinds: Vec<&str> =
                results.iter().map(|r| r.error().unwrap().kind.as_str()).collect();
            assert_eq!(kinds, ["ImageTooSmallError", INTERNAL_ERROR_KIND, "ImageTooSmallError"]);
            assert_eq!(results[2].run_id, "batch_003");
            assert_eq!(results[2].metadata, PatientMetadata::new(30, Sex::Male));
        }
    }

    #[test]
    fn missing_component_is_reported_at_init() {
        let mut p = pipeline(Config::default());
        p.estimator = None;
        assert!(!p.is_ready());

        let result = p.run(&radiograph(300, 300), &PatientMetadata::default(), None, None);
        let err = result.error().unwrap();
        assert_eq!(err.kind, "ComponentMissingError");
        assert_eq!(err.stage, STAGE_INIT);
        assert!(err.message.contains("landmark estimator"));

        let mut p = pipeline(Config::default());
        p.normal_ranges = None;
        let result = p.run(&radiograph(300, 300), &PatientMetadata::default(), None, None);
        let err = result.error().unwrap();
        assert_eq!(err.kind, "ComponentMissingError");
        assert!(err.message.contains("normal range table"));
    }

    #[test]
    fn serialized_result_shape() {
        let p = pipeline(Config::default());
        let meta = PatientMetadata::default();
        let ok = p.run(&radiograph(300, 300), &meta, None, Some("x"));
        let ok = serde_json::to_value(ok).unwrap();
        assert_eq!(ok["success"], true);
        assert!(ok["analysis"]["landmarks"]["coordinates"]["N"].is_array());
        assert!(ok.get("error").is_none());

        let failed = p.run(&radiograph(10, 10), &meta, None, Some("y"));
        let failed = serde_json::to_value(failed).unwrap();
        assert_eq!(failed["success"], false);
        assert_eq!(failed["error"]["type"], "ImageTooSmallError");
        assert_eq!(failed["error"]["stage"], "preprocess");
    }
}
