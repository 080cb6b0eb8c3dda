// src/classifier.rs - Hybrid rule + seeded statistical malocclusion classifier
// Confidence formulas and demographic bias constants are demo heuristics,
// not a validated clinical model. They stay fixed for reproducibility.

use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use crate::clinical_metrics::{MetricName, MetricValues, MetricsReport, NormalRange};
use crate::errors::Result;
use crate::norms::{personalized_deviation, personalized_range, AgeGroup, Deviation, Direction, Sex};

pub const CLASSIFIER_VERSION: &str = "2.0";

const DEFAULT_AGE: u32 = 25;
const THRESHOLD_MARGIN: f64 = 0.5;
const SEED_MODULUS: u128 = 1 << 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MalocclusionClass {
    #[serde(rename = "Class I")]
    ClassI,
    #[serde(rename = "Class II")]
    ClassII,
    #[serde(rename = "Class III")]
    ClassIII,
}

impl MalocclusionClass {
    pub const ALL: [MalocclusionClass; 3] = [
        MalocclusionClass::ClassI,
        MalocclusionClass::ClassII,
        MalocclusionClass::ClassIII,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn label(self) -> &'static str {
        match self {
            MalocclusionClass::ClassI => "Class I",
            MalocclusionClass::ClassII => "Class II",
            MalocclusionClass::ClassIII => "Class III",
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            MalocclusionClass::ClassI => "Skeletally normal jaw relationship",
            MalocclusionClass::ClassII => "Maxillary excess or mandibular deficiency",
            MalocclusionClass::ClassIII => "Mandibular excess or maxillary deficiency",
        }
    }
}

impl fmt::Display for MalocclusionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

fn default_age() -> u32 {
    DEFAULT_AGE
}

/// Patient metadata used to personalize the classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientMetadata {
    #[serde(default = "default_age")]
    pub age: u32,
    #[serde(default)]
    pub sex: Sex,
}

impl Default for PatientMetadata {
    fn default() -> Self {
        Self { age: DEFAULT_AGE, sex: Sex::Unknown }
    }
}

impl PatientMetadata {
    pub fn new(age: u32, sex: Sex) -> Self {
        Self { age, sex }
    }

    pub fn age_group(&self) -> AgeGroup {
        AgeGroup::from_age(self.age)
    }

    pub fn is_growing(&self) -> bool {
        self.age <= 18
    }
}

/// Outcome of the deterministic rule stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RuleResult {
    pub class: MalocclusionClass,
    pub confidence: f64,
    pub normal_range: NormalRange,
    pub upper_threshold: f64,
    pub lower_threshold: f64,
}

/// Rule-based classification of ANB against the personalized range.
pub fn rule_classify(anb: f64, meta: &PatientMetadata) -> RuleResult {
    let range = personalized_range(MetricName::Anb, meta.age, meta.sex);
    let upper = range.max + THRESHOLD_MARGIN;
    let lower = range.min - THRESHOLD_MARGIN;

    let (class, confidence) = if anb > upper {
        (MalocclusionClass::ClassII, (0.6 + (anb - upper) * 0.1).min(0.95))
    } else if anb < lower {
        (MalocclusionClass::ClassIII, (0.6 + (lower - anb) * 0.1).min(0.95))
    } else {
        let half_width = range.width() / 2.0;
        let confidence = 0.9 - ((anb - range.center()).abs() / half_width) * 0.3;
        (MalocclusionClass::ClassI, confidence.max(0.6))
    };

    RuleResult {
        class,
        confidence,
        normal_range: range,
        upper_threshold: upper,
        lower_threshold: lower,
    }
}

/// Engineered features keyed by name. Iteration is key-sorted.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeatureVector(BTreeMap<&'static str, f64>);

impl FeatureVector {
    pub fn get(&self, key: &str) -> Option<f64> {
        self.0.get(key).copied()
    }

    fn insert(&mut self, key: &'static str, value: f64) {
        self.0.insert(key, value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, f64)> + '_ {
        self.0.iter().map(|(k, v)| (*k, *v))
    }

    /// SHA-256 over `key=value` lines in key order, values at 6 decimals;
    /// the first eight digest bytes read big-endian.
    pub fn stable_hash(&self) -> u64 {
        let mut hasher = Sha256::new();
        for (key, value) in self.iter() {
            hasher.update(format!("{}={:.6}\n", key, value).as_bytes());
        }
        let digest = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(bytes)
    }
}

const fn deviation_key(metric: MetricName) -> &'static str {
    match metric {
        MetricName::Sna => "SNA_personalized_deviation",
        MetricName::Snb => "SNB_personalized_deviation",
        MetricName::Anb => "ANB_personalized_deviation",
        MetricName::Fma => "FMA_personalized_deviation",
    }
}

/// Build the feature vector. ANB is required; other metrics contribute
/// their features only when present.
pub fn extract_features(values: &MetricValues, meta: &PatientMetadata) -> Result<FeatureVector> {
    let anb = values.require(MetricName::Anb)?;
    let age = meta.age as f64;
    let sex_encoded = meta.sex.encoded();

    let mut features = FeatureVector::default();
    features.insert("age", age);
    features.insert("sex_encoded", sex_encoded);
    features.insert("age_group", meta.age_group().ordinal() as f64);

    for metric in MetricName::ALL {
        if let Some(value) = values.get(metric) {
            features.insert(metric.as_str(), value);
            let range = personalized_range(metric, meta.age, meta.sex);
            features.insert(deviation_key(metric), personalized_deviation(value, range).magnitude);
        }
    }

    features.insert("age_sex_interaction", age * sex_encoded);

    if meta.is_growing() {
        features.insert("growth_stage", 1.0);
        features.insert("anb_growth_adjusted", anb + (18.0 - age) * 0.1);
    } else {
        features.insert("growth_stage", 0.0);
        features.insert("anb_growth_adjusted", anb);
    }

    features.insert("sagittal_discrepancy", (anb - 2.0).abs());
    if let Some(fma) = values.get(MetricName::Fma) {
        features.insert("vertical_pattern", if fma > 30.0 { 1.0 } else { 0.0 });
    }

    let sex_adjusted = match meta.sex {
        Sex::Female => anb - 0.5,
        Sex::Male => anb + 0.5,
        Sex::Unknown => anb,
    };
    features.insert("sex_adjusted_anb", sex_adjusted);

    Ok(features)
}

/// Seed of the statistical stage for a given base seed and feature vector.
pub fn feature_seed(base_seed: u64, features: &FeatureVector) -> u64 {
    ((base_seed as u128 + features.stable_hash() as u128) % SEED_MODULUS) as u64
}

/// Outcome of the seeded statistical stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelResult {
    pub class: MalocclusionClass,
    pub confidence: f64,
    pub probabilities: [f64; 3],
    pub seed: u64,
}

fn normal(rng: &mut StdRng, sigma: f64) -> f64 {
    let z: f64 = rng.sample(StandardNormal);
    z * sigma
}

fn softmax(logits: [f64; 3]) -> [f64; 3] {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exp = logits.map(|l| (l - max).exp());
    let sum: f64 = exp.iter().sum();
    exp.map(|e| e / sum)
}

/// Index of the largest value; ties go to the lowest index.
fn argmax(values: &[f64; 3]) -> usize {
    let mut best = 0;
    for i in 1..values.len() {
        if values[i] > values[best] {
            best = i;
        }
    }
    best
}

/// Seeded pseudo-model over the feature vector. The generator is local to
/// the call and draws in a fixed order.
pub fn statistical_classify(
    features: &FeatureVector,
    anb_deviation: Deviation,
    meta: &PatientMetadata,
    base_seed: u64,
) -> ModelResult {
    let seed = feature_seed(base_seed, features);
    let mut rng = StdRng::seed_from_u64(seed);

    let mut logits = [0.0f64; 3];
    for logit in logits.iter_mut() {
        *logit = normal(&mut rng, 0.8);
    }

    let (i, ii, iii) = (
        MalocclusionClass::ClassI.index(),
        MalocclusionClass::ClassII.index(),
        MalocclusionClass::ClassIII.index(),
    );
    if anb_deviation.magnitude > 0.5 {
        let boost = 1.5 + anb_deviation.magnitude;
        match anb_deviation.direction {
            Direction::Below => logits[iii] += boost,
            _ => logits[ii] += boost,
        }
    } else if anb_deviation.magnitude < 0.1 {
        logits[i] += 1.0;
    }

    match meta.age_group() {
        AgeGroup::Child => {
            for logit in logits.iter_mut() {
                *logit += normal(&mut rng, 0.3);
            }
        }
        AgeGroup::MiddleAged => logits[i] += 0.3,
        _ => {}
    }

    match meta.sex {
        Sex::Female => logits[ii] += 0.2,
        Sex::Male => logits[iii] += 0.2,
        Sex::Unknown => {}
    }

    if meta.is_growing() {
        for logit in logits.iter_mut() {
            *logit += normal(&mut rng, 0.2);
        }
    }

    let probabilities = softmax(logits);
    let best = argmax(&probabilities);
    ModelResult {
        class: MalocclusionClass::ALL[best],
        confidence: probabilities[best],
        probabilities,
        seed,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionWeights {
    pub rule_based: f64,
    pub model_based: f64,
    pub explanation: String,
}

/// Rule/model weights: 0.6/0.4 by default, 0.7/0.3 past half a range width,
/// 0.8/0.2 past a full width; children move 0.1 to the model.
pub fn fusion_weights(anb_deviation: f64, meta: &PatientMetadata) -> FusionWeights {
    let (mut rule, mut model) = if anb_deviation > 1.0 {
        (0.8, 0.2)
    } else if anb_deviation > 0.5 {
        (0.7, 0.3)
    } else {
        (0.6, 0.4)
    };

    if meta.age <= 15 {
        rule -= 0.1;
        model += 0.1;
    }

    let total = rule + model;
    FusionWeights {
        rule_based: rule / total,
        model_based: model / total,
        explanation: format!("Personalized weights for age {}, sex {}", meta.age, meta.sex),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComponentResult {
    pub class: MalocclusionClass,
    pub confidence: f64,
    pub weight: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Components {
    pub rule_based: ComponentResult,
    pub model_based: ComponentResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonalizedAnalysis {
    pub age_group: AgeGroup,
    pub sex: Sex,
    pub normal_range_anb: NormalRange,
    pub anb_deviation: f64,
    pub deviation_direction: Direction,
    pub growth_adjusted: bool,
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub predicted_class: MalocclusionClass,
    pub description: String,
    pub confidence: f64,
    /// Indexed by class: I, II, III
    pub probabilities: [f64; 3],
    pub anb_value: f64,
    pub personalized_analysis: PersonalizedAnalysis,
    pub weights: FusionWeights,
    pub components: Components,
}

impl ClassificationResult {
    pub fn probability(&self, class: MalocclusionClass) -> f64 {
        self.probabilities[class.index()]
    }
}

fn rationale(anb: f64, rule: &RuleResult, meta: &PatientMetadata) -> String {
    let range = rule.normal_range;
    let who = format!("{} {}", meta.age_group(), meta.sex.label());

    let mut parts = Vec::new();
    if anb > rule.upper_threshold {
        parts.push(format!(
            "ANB {:.1}° > {:.1}° threshold ({} range {:.1}-{:.1}°)",
            anb, rule.upper_threshold, who, range.min, range.max
        ));
    } else if anb < rule.lower_threshold {
        parts.push(format!(
            "ANB {:.1}° < {:.1}° threshold ({} range {:.1}-{:.1}°)",
            anb, rule.lower_threshold, who, range.min, range.max
        ));
    } else {
        parts.push(format!(
            "ANB {:.1}° within {:.1}-{:.1}° thresholds ({} range {:.1}-{:.1}°)",
            anb, rule.lower_threshold, rule.upper_threshold, who, range.min, range.max
        ));
    }

    if meta.age <= 15 {
        parts.push("growth-stage variability considered".to_string());
    }
    if meta.is_growing() {
        parts.push("growth adjustment applied".to_string());
    }

    parts.join(" | ")
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassifierInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub seed: u64,
    pub age_groups: [AgeGroup; 4],
    pub sex_differentiation: bool,
    pub growth_adjustment: bool,
}

/// Hybrid rule + seeded statistical malocclusion classifier.
#[derive(Debug, Clone)]
pub struct MalocclusionClassifier {
    seed: u64,
}

impl MalocclusionClassifier {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn classify_report(
        &self,
        report: &MetricsReport,
        meta: &PatientMetadata,
    ) -> Result<ClassificationResult> {
        self.classify(&report.values(), meta)
    }

    /// Classify from metric values. Fails with `MissingMetric` when ANB is absent.
    pub fn classify(
        &self,
        values: &MetricValues,
        meta: &PatientMetadata,
    ) -> Result<ClassificationResult> {
        let anb = values.require(MetricName::Anb)?;
        let features = extract_features(values, meta)?;

        let rule = rule_classify(anb, meta);
        let deviation = personalized_deviation(anb, rule.normal_range);
        let model = statistical_classify(&features, deviation, meta, self.seed);
        let weights = fusion_weights(deviation.magnitude, meta);

        let mut fused = model.probabilities.map(|p| weights.model_based * p);
        fused[rule.class.index()] += weights.rule_based * rule.confidence;
        let total: f64 = fused.iter().sum();
        let probabilities = fused.map(|p| p / total);

        let best = argmax(&probabilities);
        let predicted_class = MalocclusionClass::ALL[best];

        debug!(
            "Classified ANB {:.2}: rule {} ({:.3}), model {} ({:.3}), \
             weights {:.2}/{:.2} -> {} ({:.3})",
            anb,
            rule.class,
            rule.confidence,
            model.class,
            model.confidence,
            weights.rule_based,
            weights.model_based,
            predicted_class,
            probabilities[best]
        );

        Ok(ClassificationResult {
            predicted_class,
            description: predicted_class.description().to_string(),
            confidence: probabilities[best],
            probabilities,
            anb_value: anb,
            personalized_analysis: PersonalizedAnalysis {
                age_group: meta.age_group(),
                sex: meta.sex,
                normal_range_anb: rule.normal_range,
                anb_deviation: deviation.magnitude,
                deviation_direction: deviation.direction,
                growth_adjusted: meta.is_growing(),
                rationale: rationale(anb, &rule, meta),
            },
            components: Components {
                rule_based: ComponentResult {
                    class: rule.class,
                    confidence: rule.confidence,
                    weight: weights.rule_based,
                },
                model_based: ComponentResult {
                    class: model.class,
                    confidence: model.confidence,
                    weight: weights.model_based,
                },
            },
            weights,
        })
    }

    pub fn info(&self) -> ClassifierInfo {
        ClassifierInfo {
            name: "MalocclusionClassifier",
            version: CLASSIFIER_VERSION,
            seed: self.seed,
            age_groups: [
                AgeGroup::Child,
                AgeGroup::YoungAdult,
                AgeGroup::Adult,
                AgeGroup::MiddleAged,
            ],
            sex_differentiation: true,
            growth_adjustment: true,
        }
    }
}
