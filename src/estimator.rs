// src/estimator.rs - Deterministic landmark estimation from reference templates and anchors
// Every mode ends with seeded Gaussian jitter and boundary clamping.

use image::DynamicImage;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::errors::Result;
use crate::geometry::similarity_transform;
use crate::image_utils::{content_hash, ImageDescriptor};
use crate::landmarks::{Landmark, LandmarkSet, Point, LANDMARK_COUNT};
use crate::reference_shape::ReferenceShape;

/// Wide images: anterior profile is pulled toward the horizontal center by this factor.
const WIDE_ASPECT: f64 = 1.5;
const WIDE_COMPRESSION: f64 = 0.9;
/// Near-square images: all landmarks are pulled toward the vertical center.
const SQUARE_ASPECT: f64 = 1.1;
const SQUARE_COMPRESSION: f64 = 0.95;

const DARK_MEAN: f64 = 60.0;
const BRIGHT_MEAN: f64 = 180.0;
const BRIGHTNESS_NUDGE: f64 = 0.02;

/// Po/Or may differ in height by at most this much before being levelled.
const FH_LEVEL_TOLERANCE: f64 = 0.05;
const VERTICAL_MARGIN: f64 = 0.01;
const PORION_ORBITALE_GAP: f64 = 0.02;

const ANTERIOR_PROFILE: [Landmark; 11] = [
    Landmark::A,
    Landmark::B,
    Landmark::U1,
    Landmark::L1,
    Landmark::Ls,
    Landmark::Li,
    Landmark::Pog,
    Landmark::SoftPog,
    Landmark::Pn,
    Landmark::Ans,
    Landmark::Gn,
];
const INTERNAL_STRUCTURES: [Landmark; 4] = [Landmark::S, Landmark::Ar, Landmark::Pns, Landmark::Go];
const ANTERIOR_POINTS: [Landmark; 4] = [Landmark::A, Landmark::B, Landmark::Pog, Landmark::Pn];

/// How the landmark positions for a call were obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceMode {
    Precomputed,
    AdaptiveHeuristic,
    ManualCorrected,
}

impl InferenceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            InferenceMode::Precomputed => "precomputed",
            InferenceMode::AdaptiveHeuristic => "adaptive_heuristic",
            InferenceMode::ManualCorrected => "manual_corrected",
        }
    }
}

/// Template adjustments applied in the adaptive path, recorded for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Adjustment {
    WideImageCompression,
    SquareImageCompression,
    DarkImageShift,
    BrightImageShift,
    FrankfortLevelled,
    VerticalBoundsClamped,
    PorionOrderCorrected,
}

/// Noise difficulty tier of a landmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseTier {
    Low,
    Medium,
    High,
}

impl NoiseTier {
    pub fn of(landmark: Landmark) -> Self {
        match landmark {
            Landmark::N | Landmark::S | Landmark::Or | Landmark::Po | Landmark::Me => {
                NoiseTier::Low
            }
            Landmark::A
            | Landmark::B
            | Landmark::Ans
            | Landmark::Pns
            | Landmark::U1
            | Landmark::L1
            | Landmark::Pog
            | Landmark::Gn => NoiseTier::Medium,
            Landmark::Ar
            | Landmark::Go
            | Landmark::Ls
            | Landmark::Li
            | Landmark::SoftPog
            | Landmark::Pn => NoiseTier::High,
        }
    }

    pub fn multiplier(self) -> f64 {
        match self {
            NoiseTier::Low => 0.67,
            NoiseTier::Medium => 1.0,
            NoiseTier::High => 1.33,
        }
    }
}

/// User-supplied Frankfort anchors in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Anchors {
    pub orbitale: Point,
    pub porion: Point,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EstimatorOptions {
    pub seed: u64,
    pub clamp_margin_px: f64,
    pub jitter_base_sigma: f64,
    pub hash_resolution: u32,
}

impl Default for EstimatorOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for EstimatorOptions {
    fn from(config: &Config) -> Self {
        Self {
            seed: config.seed,
            clamp_margin_px: config.clamp_margin_px,
            jitter_base_sigma: config.jitter_base_sigma,
            hash_resolution: config.hash_resolution,
        }
    }
}

/// Output of one estimation call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LandmarkEstimate {
    pub landmarks: LandmarkSet,
    pub mode: InferenceMode,
    pub descriptor: ImageDescriptor,
    pub content_hash: String,
    pub adjustments: Vec<Adjustment>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EstimatorInfo {
    pub engine: &'static str,
    pub version: &'static str,
    pub seed: u64,
    pub canonical_hash_prefix: String,
    pub landmark_count: usize,
    pub supported_modes: [InferenceMode; 3],
}

pub struct LandmarkEstimator {
    canonical: ReferenceShape,
    mean_shape: ReferenceShape,
    options: EstimatorOptions,
}

impl LandmarkEstimator {
    pub fn new(
        canonical: ReferenceShape,
        mean_shape: ReferenceShape,
        options: EstimatorOptions,
    ) -> Self {
        info!(
            "Landmark estimator ready (seed={}, canonical hash {})",
            options.seed,
            hash_prefix(canonical.content_hash.as_deref())
        );
        Self { canonical, mean_shape, options }
    }

    /// Load both templates named by the configuration. Either one failing is fatal.
    pub fn from_config(config: &Config) -> Result<Self> {
        let canonical = ReferenceShape::canonical_from_file(config.canonical_shape_path())?;
        let mean_shape = ReferenceShape::from_file(config.mean_shape_path())?;
        Ok(Self::new(canonical, mean_shape, EstimatorOptions::from(config)))
    }

    pub fn options(&self) -> &EstimatorOptions {
        &self.options
    }

    pub fn canonical_shape(&self) -> &ReferenceShape {
        &self.canonical
    }

    pub fn mean_shape(&self) -> &ReferenceShape {
        &self.mean_shape
    }

    /// Estimate the 19 landmarks of `image`.
    pub fn estimate(&self, image: &DynamicImage, anchors: Option<&Anchors>) -> LandmarkEstimate {
        let descriptor = ImageDescriptor::from_image(image);
        let hash = content_hash(image, self.options.hash_resolution);
        self.estimate_from_descriptor(&descriptor, &hash, anchors)
    }

    /// Estimation given precomputed image statistics and content hash.
    pub fn estimate_from_descriptor(
        &self,
        descriptor: &ImageDescriptor,
        hash: &str,
        anchors: Option<&Anchors>,
    ) -> LandmarkEstimate {
        let (placed, mode, adjustments) = self.place_landmarks(descriptor, hash, anchors);

        let sigma_scale = sharpness_factor(descriptor);
        let sigma = self.options.jitter_base_sigma * sigma_scale;
        let jittered = apply_jitter(&placed, sigma, self.options.seed);
        let landmarks = clamp_to_image(
            &jittered,
            descriptor.width as f64,
            descriptor.height as f64,
            self.options.clamp_margin_px,
        );

        debug!(
            "Landmarks estimated in {} mode ({}x{}, sigma scale {:.3}, {} adjustments)",
            mode.as_str(),
            descriptor.width,
            descriptor.height,
            sigma_scale,
            adjustments.len()
        );

        LandmarkEstimate {
            landmarks,
            mode,
            descriptor: *descriptor,
            content_hash: hash.to_string(),
            adjustments,
        }
    }

    /// Mode resolution without the jitter and clamping post-steps.
    pub fn place_landmarks(
        &self,
        descriptor: &ImageDescriptor,
        hash: &str,
        anchors: Option<&Anchors>,
    ) -> (LandmarkSet, InferenceMode, Vec<Adjustment>) {
        let width = descriptor.width as f64;
        let height = descriptor.height as f64;

        if self.is_canonical_match(hash) {
            let scaled = self.canonical.landmarks.scaled(width, height);
            return (scaled, InferenceMode::Precomputed, Vec::new());
        }

        let (adapted, adjustments) = adapt_template(&self.mean_shape.landmarks, descriptor);
        let placed = adapted.scaled(width, height);

        match anchors {
            Some(anchors) => match (placed.get(Landmark::Or), placed.get(Landmark::Po)) {
                (Some(current_or), Some(current_po)) => {
                    let corrected = similarity_transform(
                        &placed,
                        current_or,
                        current_po,
                        anchors.orbitale,
                        anchors.porion,
                    );
                    (corrected, InferenceMode::ManualCorrected, adjustments)
                }
                _ => (placed, InferenceMode::AdaptiveHeuristic, adjustments),
            },
            None => (placed, InferenceMode::AdaptiveHeuristic, adjustments),
        }
    }

    pub fn is_canonical_match(&self, hash: &str) -> bool {
        match self.canonical.content_hash.as_deref() {
            Some(expected) => !expected.is_empty() && expected == hash,
            None => false,
        }
    }

    pub fn info(&self) -> EstimatorInfo {
        EstimatorInfo {
            engine: "LandmarkEstimator",
            version: env!("CARGO_PKG_VERSION"),
            seed: self.options.seed,
            canonical_hash_prefix: hash_prefix(self.canonical.content_hash.as_deref()),
            landmark_count: LANDMARK_COUNT,
            supported_modes: [
                InferenceMode::Precomputed,
                InferenceMode::AdaptiveHeuristic,
                InferenceMode::ManualCorrected,
            ],
        }
    }
}

fn hash_prefix(hash: Option<&str>) -> String {
    match hash {
        Some(h) if h.chars().count() > 16 => {
            format!("{}...", h.chars().take(16).collect::<String>())
        }
        Some(h) => h.to_string(),
        None => "<none>".to_string(),
    }
}

/// Adjust a normalized template from image statistics and enforce
/// anatomical consistency.
pub fn adapt_template(
    template: &LandmarkSet,
    descriptor: &ImageDescriptor,
) -> (LandmarkSet, Vec<Adjustment>) {
    let mut shape = template.clone();
    let mut adjustments = Vec::new();

    if descriptor.aspect_ratio > WIDE_ASPECT {
        for landmark in ANTERIOR_PROFILE {
            update(&mut shape, landmark, |p| Point::new(0.5 + (p.x - 0.5) * WIDE_COMPRESSION, p.y));
        }
        adjustments.push(Adjustment::WideImageCompression);
    } else if descriptor.aspect_ratio < SQUARE_ASPECT {
        shape = shape.map_points(|_, p| Point::new(p.x, 0.5 + (p.y - 0.5) * SQUARE_COMPRESSION));
        adjustments.push(Adjustment::SquareImageCompression);
    }

    if descriptor.mean_brightness < DARK_MEAN {
        for landmark in INTERNAL_STRUCTURES {
            update(&mut shape, landmark, |p| Point::new(p.x, p.y - BRIGHTNESS_NUDGE));
        }
        adjustments.push(Adjustment::DarkImageShift);
    } else if descriptor.mean_brightness > BRIGHT_MEAN {
        for landmark in ANTERIOR_POINTS {
            update(&mut shape, landmark, |p| Point::new(p.x + BRIGHTNESS_NUDGE, p.y));
        }
        adjustments.push(Adjustment::BrightImageShift);
    }

    enforce_anatomical_consistency(&mut shape, &mut adjustments);
    (shape, adjustments)
}

fn update<F: FnOnce(Point) -> Point>(shape: &mut LandmarkSet, landmark: Landmark, f: F) {
    if let Some(p) = shape.get(landmark) {
        shape.set(landmark, f(p));
    }
}

fn enforce_anatomical_consistency(shape: &mut LandmarkSet, adjustments: &mut Vec<Adjustment>) {
    // Frankfort horizontal: Po and Or share a height.
    if let (Some(po), Some(or)) = (shape.get(Landmark::Po), shape.get(Landmark::Or)) {
        if (po.y - or.y).abs() > FH_LEVEL_TOLERANCE {
            let level = (po.y + or.y) / 2.0;
            shape.set(Landmark::Po, Point::new(po.x, level));
            shape.set(Landmark::Or, Point::new(or.x, level));
            adjustments.push(Adjustment::FrankfortLevelled);
        }
    }

    // Nothing above Nasion or below Menton.
    if let (Some(top), Some(bottom)) = (shape.get(Landmark::N), shape.get(Landmark::Me)) {
        let mut clamped = false;
        for landmark in Landmark::ALL {
            if landmark == Landmark::N || landmark == Landmark::Me {
                continue;
            }
            if let Some(p) = shape.get(landmark) {
                let y = if p.y < top.y {
                    top.y + VERTICAL_MARGIN
                } else if p.y > bottom.y {
                    bottom.y - VERTICAL_MARGIN
                } else {
                    continue;
                };
                shape.set(landmark, Point::new(p.x, y));
                clamped = true;
            }
        }
        if clamped {
            adjustments.push(Adjustment::VerticalBoundsClamped);
        }
    }

    // Porion lies posterior (left) of Orbitale.
    if let (Some(po), Some(or)) = (shape.get(Landmark::Po), shape.get(Landmark::Or)) {
        if po.x > or.x - PORION_ORBITALE_GAP {
            shape.set(Landmark::Po, Point::new(or.x - PORION_ORBITALE_GAP, po.y));
            adjustments.push(Adjustment::PorionOrderCorrected);
        }
    }
}

/// Noise scale from image sharpness: sharper images (more edge energy relative
/// to their brightness spread) get less jitter. A flat image yields 1.0.
pub fn sharpness_factor(descriptor: &ImageDescriptor) -> f64 {
    let baseline = 1.0 + 0.1 * descriptor.brightness_std;
    (baseline / (1.0 + descriptor.edge_intensity)).clamp(0.5, 1.5)
}

/// Seeded Gaussian perturbation; draws happen in canonical landmark order,
/// x then y, from a generator created for this call only.
pub fn apply_jitter(points: &LandmarkSet, sigma: f64, seed: u64) -> LandmarkSet {
    let mut rng = StdRng::seed_from_u64(seed);
    points.map_points(|landmark, p| {
        let tier_sigma = sigma * NoiseTier::of(landmark).multiplier();
        let dx: f64 = rng.sample(StandardNormal);
        let dy: f64 = rng.sample(StandardNormal);
        Point::new(p.x + dx * tier_sigma, p.y + dy * tier_sigma)
    })
}

/// Clamp every coordinate to `[margin, dim - margin]`.
pub fn clamp_to_image(points: &LandmarkSet, width: f64, height: f64, margin: f64) -> LandmarkSet {
    let max_x = (width - margin).max(margin);
    let max_y = (height - margin).max(margin);
    points.map_points(|_, p| Point::new(p.x.clamp(margin, max_x), p.y.clamp(margin, max_y)))
}
