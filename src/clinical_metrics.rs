// src/clinical_metrics.rs - SNA, SNB, ANB (= SNA - SNB) and FMA with normal-range assessment

use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use crate::errors::{CephError, Result};
use crate::geometry::{angle_at_vertex, angle_between_lines};
use crate::landmarks::{Landmark, LandmarkSet, Point};

/// Landmarks every metrics computation needs.
pub const REQUIRED_LANDMARKS: [Landmark; 8] = [
    Landmark::S,
    Landmark::N,
    Landmark::A,
    Landmark::B,
    Landmark::Po,
    Landmark::Or,
    Landmark::Go,
    Landmark::Me,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MetricName {
    #[serde(rename = "SNA")]
    Sna,
    #[serde(rename = "SNB")]
    Snb,
    #[serde(rename = "ANB")]
    Anb,
    #[serde(rename = "FMA")]
    Fma,
}

impl MetricName {
    pub const ALL: [MetricName; 4] =
        [MetricName::Sna, MetricName::Snb, MetricName::Anb, MetricName::Fma];

    pub const fn as_str(self) -> &'static str {
        match self {
            MetricName::Sna => "SNA",
            MetricName::Snb => "SNB",
            MetricName::Anb => "ANB",
            MetricName::Fma => "FMA",
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricStatus {
    Low,
    Normal,
    High,
}

/// Inclusive `[min, max]` range, serialized as a two-element array.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct NormalRange {
    pub min: f64,
    pub max: f64,
}

impl NormalRange {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn center(&self) -> f64 {
        (self.min + self.max) / 2.0
    }

    pub fn width(&self) -> f64 {
        self.max - self.min
    }

    pub fn status_of(&self, value: f64) -> MetricStatus {
        if value < self.min {
            MetricStatus::Low
        } else if value > self.max {
            MetricStatus::High
        } else {
            MetricStatus::Normal
        }
    }
}

impl From<[f64; 2]> for NormalRange {
    fn from([min, max]: [f64; 2]) -> Self {
        Self { min, max }
    }
}

impl From<NormalRange> for [f64; 2] {
    fn from(range: NormalRange) -> Self {
        [range.min, range.max]
    }
}

fn default_unit() -> String {
    "degrees".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDefinition {
    pub normal_range: NormalRange,
    #[serde(default = "default_unit")]
    pub unit: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub clinical_significance: String,
}

impl MetricDefinition {
    fn builtin(min: f64, max: f64) -> Self {
        Self {
            normal_range: NormalRange::new(min, max),
            unit: default_unit(),
            description: String::new(),
            clinical_significance: String::new(),
        }
    }
}

/// Normal ranges per metric, loaded from the normal-range resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalRangeConfig {
    pub metrics: BTreeMap<MetricName, MetricDefinition>,
}

impl NormalRangeConfig {
    /// The fallback table used when no resource is available.
    pub fn builtin() -> Self {
        let mut metrics = BTreeMap::new();
        metrics.insert(MetricName::Sna, MetricDefinition::builtin(80.0, 84.0));
        metrics.insert(MetricName::Snb, MetricDefinition::builtin(78.0, 82.0));
        metrics.insert(MetricName::Anb, MetricDefinition::builtin(0.0, 4.0));
        metrics.insert(MetricName::Fma, MetricDefinition::builtin(25.0, 30.0));
        Self { metrics }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| CephError::ConfigRead {
            source: e,
            path: path.to_path_buf(),
        })?;
        let config: NormalRangeConfig =
            serde_json::from_str(&content).map_err(|e| CephError::ConfigLoad {
                source: e,
                path: path.to_path_buf(),
            })?;

        for name in MetricName::ALL {
            let def = config.metrics.get(&name).ok_or_else(|| CephError::InvalidResource {
                path: path.to_path_buf(),
                reason: format!("no entry for {}", name),
            })?;
            if !(def.normal_range.min <= def.normal_range.max) {
                return Err(CephError::InvalidResource {
                    path: path.to_path_buf(),
                    reason: format!("normal range for {} is inverted or not a number", name),
                });
            }
        }

        Ok(config)
    }

    /// Load the resource, or the built-in table when the file is absent and
    /// the caller allows it. A present but corrupt file is always an error.
    pub fn load<P: AsRef<Path>>(path: P, allow_builtin: bool) -> Result<Self> {
        let path = path.as_ref();
        match Self::from_file(path) {
            Err(CephError::ConfigRead { source, .. })
                if allow_builtin && source.kind() == ErrorKind::NotFound =>
            {
                warn!("Normal-range resource {} not found, using built-in table", path.display());
                Ok(Self::builtin())
            }
            other => other,
        }
    }

    pub fn definition(&self, name: MetricName) -> Option<&MetricDefinition> {
        self.metrics.get(&name)
    }
}

/// One measured clinical angle with its assessment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClinicalMetric {
    pub name: MetricName,
    pub value: f64,
    pub unit: String,
    pub normal_range: NormalRange,
    pub status: MetricStatus,
    pub description: String,
    pub clinical_significance: String,
}

impl ClinicalMetric {
    fn assess(name: MetricName, value: f64, ranges: &NormalRangeConfig) -> Result<Self> {
        let def = ranges.definition(name).ok_or(CephError::MissingMetric(name))?;
        Ok(Self {
            name,
            value,
            unit: def.unit.clone(),
            normal_range: def.normal_range,
            status: def.normal_range.status_of(value),
            description: def.description.clone(),
            clinical_significance: def.clinical_significance.clone(),
        })
    }

    pub fn is_normal(&self) -> bool {
        self.status == MetricStatus::Normal
    }
}

/// The four clinical metrics of one landmark set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    #[serde(rename = "SNA")]
    pub sna: ClinicalMetric,
    #[serde(rename = "SNB")]
    pub snb: ClinicalMetric,
    #[serde(rename = "ANB")]
    pub anb: ClinicalMetric,
    #[serde(rename = "FMA")]
    pub fma: ClinicalMetric,
}

impl MetricsReport {
    pub fn get(&self, name: MetricName) -> &ClinicalMetric {
        match name {
            MetricName::Sna => &self.sna,
            MetricName::Snb => &self.snb,
            MetricName::Anb => &self.anb,
            MetricName::Fma => &self.fma,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClinicalMetric> {
        [&self.sna, &self.snb, &self.anb, &self.fma].into_iter()
    }

    pub fn abnormal_count(&self) -> usize {
        self.iter().filter(|m| !m.is_normal()).count()
    }

    pub fn values(&self) -> MetricValues {
        self.iter().map(|m| (m.name, m.value)).collect()
    }
}

/// Plain metric values, as consumed by the classifier. Callers may build this
/// directly to recompute a classification from edited values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricValues(pub BTreeMap<MetricName, f64>);

impl MetricValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: MetricName, value: f64) -> Self {
        self.0.insert(name, value);
        self
    }

    pub fn get(&self, name: MetricName) -> Option<f64> {
        self.0.get(&name).copied()
    }

    pub fn require(&self, name: MetricName) -> Result<f64> {
        self.get(name).ok_or(CephError::MissingMetric(name))
    }
}

impl FromIterator<(MetricName, f64)> for MetricValues {
    fn from_iter<I: IntoIterator<Item = (MetricName, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Check that the required landmarks are present with finite coordinates.
pub fn validate_landmarks(landmarks: &LandmarkSet) -> Result<()> {
    for landmark in REQUIRED_LANDMARKS {
        match landmarks.get(landmark) {
            Some(p) if p.is_finite() => {}
            _ => return Err(CephError::MissingLandmark(landmark)),
        }
    }
    Ok(())
}

fn required(landmarks: &LandmarkSet, landmark: Landmark) -> Result<Point> {
    landmarks.get(landmark).ok_or(CephError::MissingLandmark(landmark))
}

pub fn calculate_sna(landmarks: &LandmarkSet) -> Result<f64> {
    Ok(angle_at_vertex(
        required(landmarks, Landmark::S)?,
        required(landmarks, Landmark::N)?,
        required(landmarks, Landmark::A)?,
    ))
}

pub fn calculate_snb(landmarks: &LandmarkSet) -> Result<f64> {
    Ok(angle_at_vertex(
        required(landmarks, Landmark::S)?,
        required(landmarks, Landmark::N)?,
        required(landmarks, Landmark::B)?,
    ))
}

pub fn calculate_fma(landmarks: &LandmarkSet) -> Result<f64> {
    Ok(angle_between_lines(
        required(landmarks, Landmark::Po)?,
        required(landmarks, Landmark::Or)?,
        required(landmarks, Landmark::Go)?,
        required(landmarks, Landmark::Me)?,
    ))
}

/// Compute and assess SNA, SNB, ANB and FMA.
pub fn compute_all(landmarks: &LandmarkSet, ranges: &NormalRangeConfig) -> Result<MetricsReport> {
    validate_landmarks(landmarks)?;

    let sna = calculate_sna(landmarks)?;
    let snb = calculate_snb(landmarks)?;
    let anb = sna - snb;
    let fma = calculate_fma(landmarks)?;

    Ok(MetricsReport {
        sna: ClinicalMetric::assess(MetricName::Sna, sna, ranges)?,
        snb: ClinicalMetric::assess(MetricName::Snb, snb, ranges)?,
        anb: ClinicalMetric::assess(MetricName::Anb, anb, ranges)?,
        fma: ClinicalMetric::assess(MetricName::Fma, fma, ranges)?,
    })
}
