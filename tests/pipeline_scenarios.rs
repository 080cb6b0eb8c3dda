use std::fs;
use std::path::Path;

use assert_approx_eq::assert_approx_eq;
use image::{DynamicImage, Rgb, RgbImage};

use cephalometric_rust_lib::config::Config;
use cephalometric_rust_lib::estimator::{
    Anchors, EstimatorOptions, InferenceMode, LandmarkEstimator,
};
use cephalometric_rust_lib::image_io::get_image_files_in_dir;
use cephalometric_rust_lib::image_utils::{content_hash, ImageDescriptor};
use cephalometric_rust_lib::pipeline::STAGE_LOAD;
use cephalometric_rust_lib::{
    CephalometricPipeline, Landmark, LandmarkSet, MalocclusionClassifier, NormalRangeConfig,
    PatientMetadata, Point, ReferenceShape, Sex,
};

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

/// Synthetic radiograph: dark background with a bright skull-like ellipse.
fn radiograph(width: u32, height: u32, phase: u32) -> DynamicImage {
    let (cx, cy) = (width as f64 / 2.0, height as f64 / 2.0);
    DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
        let dx = (x as f64 - cx) / (width as f64 * 0.35);
        let dy = (y as f64 - cy) / (height as f64 * 0.4);
        let inside = dx * dx + dy * dy < 1.0;
        let base = if inside { 170 } else { 35 };
        let v = (base + ((x + y + phase) % 23)) as u8;
        Rgb([v, v, v])
    }))
}

fn write_shape(dir: &Path, name: &str, shape: &ReferenceShape) {
    fs::write(dir.join(name), serde_json::to_string_pretty(shape).unwrap()).unwrap();
}

/// Resource directory whose canonical shape matches `canonical_image`.
fn resource_dir(canonical_image: &DynamicImage) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let mut canonical = ReferenceShape::new(template());
    canonical.content_hash = Some(content_hash(canonical_image, 256));
    canonical.image_dimensions = Some([canonical_image.width(), canonical_image.height()]);
    write_shape(dir.path(), "demo_landmarks.json", &canonical);
    write_shape(dir.path(), "mean_shape.json", &ReferenceShape::new(template()));
    dir
}

fn estimator_for(dir: &Path, config: &Config) -> LandmarkEstimator {
    let canonical = ReferenceShape::canonical_from_file(dir.join("demo_landmarks.json")).unwrap();
    let mean = ReferenceShape::from_file(dir.join("mean_shape.json")).unwrap();
    LandmarkEstimator::new(canonical, mean, EstimatorOptions::from(config))
}

fn pipeline_for(dir: &Path, config: Config) -> CephalometricPipeline {
    let estimator = estimator_for(dir, &config);
    let seed = config.seed;
    CephalometricPipeline::from_components(
        config,
        estimator,
        NormalRangeConfig::builtin(),
        MalocclusionClassifier::new(seed),
    )
}

#[test]
fn canonical_image_uses_precomputed_landmarks() {
    let image = radiograph(800, 600, 0);
    let dir = resource_dir(&image);
    let config = Config::default();
    let estimator = estimator_for(dir.path(), &config);

    let descriptor = ImageDescriptor::from_image(&image);
    let hash = content_hash(&image, config.hash_resolution);
    let (placed, mode, adjustments) = estimator.place_landmarks(&descriptor, &hash, None);
    assert_eq!(mode, InferenceMode::Precomputed);
    assert!(adjustments.is_empty());

    let n = placed.get(Landmark::N).unwrap();
    assert!((n.x - 0.585 * 800.0).abs() < 1.0);
    assert!((n.y - 0.192 * 600.0).abs() < 1.0);

    let estimate = estimator.estimate(&image, None);
    assert_eq!(estimate.mode, InferenceMode::Precomputed);
    let jittered = estimate.landmarks.get(Landmark::N).unwrap();
    assert!(jittered.distance(&n) < 6.0);
}

#[test]
fn precomputed_path_ignores_anchors() {
    let image = radiograph(800, 600, 0);
    let dir = resource_dir(&image);
    let estimator = estimator_for(dir.path(), &Config::default());

    let anchors = Anchors {
        orbitale: Point::new(500.0, 200.0),
        porion: Point::new(250.0, 210.0),
    };
    let estimate = estimator.estimate(&image, Some(&anchors));
    assert_eq!(estimate.mode, InferenceMode::Precomputed);
}

#[test]
fn near_duplicate_falls_back_to_heuristic() {
    let image = radiograph(800, 600, 0);
    let dir = resource_dir(&image);
    let pipeline = pipeline_for(dir.path(), Config::default());

    let altered = radiograph(800, 600, 7);
    let result = pipeline.run(&altered, &PatientMetadata::default(), None, None);
    let analysis = result.analysis().unwrap();
    assert_eq!(analysis.landmarks.inference_mode, InferenceMode::AdaptiveHeuristic);

    let resized = DynamicImage::ImageRgb8(image::imageops::resize(
        &image.to_rgb8(),
        700,
        525,
        image::imageops::FilterType::Triangle,
    ));
    let result = pipeline.run(&resized, &PatientMetadata::default(), None, None);
    assert_ne!(result.analysis().unwrap().landmarks.inference_mode, InferenceMode::Precomputed);
}

#[test]
fn manual_anchors_register_the_frankfort_line() {
    let image = radiograph(900, 600, 3);
    let dir = resource_dir(&radiograph(800, 600, 0));
    let config = Config::default();
    let estimator = estimator_for(dir.path(), &config);

    let anchors = Anchors {
        orbitale: Point::new(480.0, 190.0),
        porion: Point::new(300.0, 200.0),
    };
    let descriptor = ImageDescriptor::from_image(&image);
    let hash = content_hash(&image, config.hash_resolution);
    let (placed, mode, _) = estimator.place_landmarks(&descriptor, &hash, Some(&anchors));

    assert_eq!(mode, InferenceMode::ManualCorrected);
    let or = placed.get(Landmark::Or).unwrap();
    let po = placed.get(Landmark::Po).unwrap();
    assert_approx_eq!(or.x, 480.0, 1e-6);
    assert_approx_eq!(or.y, 190.0, 1e-6);
    assert_approx_eq!(po.x, 300.0, 1e-6);
    assert_approx_eq!(po.y, 200.0, 1e-6);

    let pipeline = pipeline_for(dir.path(), config);
    let result = pipeline.run(&image, &PatientMetadata::default(), Some(&anchors), None);
    let analysis = result.analysis().unwrap();
    assert!(analysis.anchors_used);
    assert_eq!(analysis.landmarks.inference_mode, InferenceMode::ManualCorrected);
}

#[test]
fn repeated_runs_are_bit_identical() {
    let dir = resource_dir(&radiograph(800, 600, 0));
    let image = radiograph(1024, 768, 11);
    let meta = PatientMetadata::new(14, Sex::Female);

    let first = pipeline_for(dir.path(), Config::default()).run(&image, &meta, None, Some("a"));
    let second = pipeline_for(dir.path(), Config::default()).run(&image, &meta, None, Some("b"));

    let (a, b) = (first.analysis().unwrap(), second.analysis().unwrap());
    assert_eq!(a.landmarks.coordinates, b.landmarks.coordinates);
    assert_eq!(a.clinical_metrics, b.clinical_metrics);
    assert_eq!(a.classification.confidence.to_bits(), b.classification.confidence.to_bits());
    assert_eq!(a.classification.probabilities, b.classification.probabilities);

    let reseeded = pipeline_for(dir.path(), Config { seed: 7, ..Config::default() });
    let other_seed = reseeded.run(&image, &meta, None, None);
    let other = other_seed.analysis().unwrap();
    assert_ne!(a.landmarks.coordinates, other.landmarks.coordinates);
}

#[test]
fn landmarks_stay_inside_the_image() {
    let dir = resource_dir(&radiograph(800, 600, 0));
    let config = Config { clamp_margin_px: 2.0, jitter_base_sigma: 40.0, ..Config::default() };
    let pipeline = pipeline_for(dir.path(), config);

    let anchors = Anchors {
        orbitale: Point::new(-500.0, -20.0),
        porion: Point::new(5000.0, 900.0),
    };
    let meta = PatientMetadata::default();
    for (width, height) in [(100, 100), (120, 400), (1600, 500), (640, 640)] {
        for anchors in [None, Some(&anchors)] {
            let result = pipeline.run(&radiograph(width, height, 1), &meta, anchors, None);
            let analysis = result.analysis().unwrap();
            let (max_x, max_y) = (width as f64 - 2.0, height as f64 - 2.0);
            for (landmark, p) in analysis.landmarks.coordinates.iter() {
                assert!(p.x >= 2.0 && p.x <= max_x, "{} x={} out of bounds", landmark, p.x);
                assert!(p.y >= 2.0 && p.y <= max_y, "{} y={} out of bounds", landmark, p.y);
            }
        }
    }
}

#[test]
fn batch_isolates_failing_items() {
    let dir = resource_dir(&radiograph(800, 600, 0));
    for use_parallel in [true, false] {
        let pipeline = pipeline_for(dir.path(), Config { use_parallel, ..Config::default() });
        let items = vec![
            (radiograph(50, 50, 0), PatientMetadata::default()),
            (radiograph(640, 480, 2), PatientMetadata::new(30, Sex::Male)),
        ];

        let results = pipeline.run_batch(&items);
        assert_eq!(results.len(), 2);

        assert_eq!(results[0].run_id, "batch_001");
        assert!(!results[0].success);
        let err = results[0].error().unwrap();
        assert_eq!(err.kind, "ImageTooSmallError");
        assert_eq!(err.stage, "preprocess");

        assert_eq!(results[1].run_id, "batch_002");
        assert!(results[1].success);
        assert_eq!(results[1].metadata, PatientMetadata::new(30, Sex::Male));

        assert_eq!(pipeline.statistics().total_runs, 1);
    }
}

#[test]
fn parallel_and_sequential_batches_agree() {
    let dir = resource_dir(&radiograph(800, 600, 0));
    let items: Vec<_> = (0..6)
        .map(|i| {
            let meta = PatientMetadata::new(10 + i * 8, Sex::Unknown);
            (radiograph(300 + i * 40, 300, i), meta)
        })
        .collect();

    let parallel = pipeline_for(dir.path(), Config::default()).run_batch(&items);
    let sequential_config = Config { use_parallel: false, ..Config::default() };
    let sequential = pipeline_for(dir.path(), sequential_config).run_batch(&items);

    for (p, s) in parallel.iter().zip(&sequential) {
        assert_eq!(p.run_id, s.run_id);
        let (p, s) = (p.analysis().unwrap(), s.analysis().unwrap());
        assert_eq!(p.landmarks.coordinates, s.landmarks.coordinates);
        assert_eq!(p.classification.predicted_class, s.classification.predicted_class);
    }
}

#[test]
fn pipeline_loads_resources_from_config_dir() {
    if std::env::var(cephalometric_rust_lib::config::DATA_DIR_ENV).is_ok() {
        return;
    }
    let dir = resource_dir(&radiograph(800, 600, 0));
    let config = Config {
        config_dir: dir.path().to_string_lossy().into_owned(),
        ..Config::default()
    };
    let pipeline = CephalometricPipeline::new(config);
    assert!(pipeline.is_ready());

    let result = pipeline.run(&radiograph(800, 600, 0), &PatientMetadata::default(), None, None);
    assert_eq!(result.analysis().unwrap().landmarks.inference_mode, InferenceMode::Precomputed);

    let info = pipeline.pipeline_info();
    assert_eq!(info.statistics.total_runs, 1);
    assert_eq!(info.estimator.unwrap().landmark_count, 19);
}

#[test]
fn strict_normal_ranges_require_the_resource() {
    if std::env::var(cephalometric_rust_lib::config::DATA_DIR_ENV).is_ok() {
        return;
    }
    let dir = resource_dir(&radiograph(800, 600, 0));
    let config = Config {
        config_dir: dir.path().to_string_lossy().into_owned(),
        allow_default_normal_ranges: false,
        ..Config::default()
    };
    let pipeline = CephalometricPipeline::new(config);
    let result = pipeline.run(&radiograph(200, 200, 0), &PatientMetadata::default(), None, None);
    let err = result.error().unwrap();
    assert_eq!(err.kind, "ConfigLoadError");
    assert_eq!(err.stage, "init");
}

#[test]
fn non_finite_anchors_leave_the_estimate_usable() {
    let dir = resource_dir(&radiograph(800, 600, 0));
    let pipeline = pipeline_for(dir.path(), Config::default());
    let anchors = Anchors {
        orbitale: Point::new(f64::NAN, 190.0),
        porion: Point::new(300.0, 200.0),
    };

    let image = radiograph(640, 480, 5);
    let result = pipeline.run(&image, &PatientMetadata::default(), Some(&anchors), None);
    let analysis = result.analysis().unwrap();
    assert_eq!(analysis.landmarks.count, 19);
    assert!(analysis.landmarks.coordinates.iter().all(|(_, p)| p.is_finite()));

    let plain = pipeline.run(&image, &PatientMetadata::default(), None, None);
    let plain = plain.analysis().unwrap();
    assert_eq!(analysis.landmarks.coordinates, plain.landmarks.coordinates);
}

#[test]
fn directory_runs_name_outputs_by_relative_path() {
    let resources = resource_dir(&radiograph(800, 600, 0));
    let pipeline = pipeline_for(resources.path(), Config::default());

    let input = tempfile::tempdir().unwrap();
    for sub in ["left", "right"] {
        fs::create_dir_all(input.path().join(sub)).unwrap();
        radiograph(320, 240, 4).save(input.path().join(sub).join("scan.png")).unwrap();
    }
    fs::write(input.path().join("broken.png"), b"not an image").unwrap();

    let files = get_image_files_in_dir(input.path()).unwrap();
    assert_eq!(files.len(), 3);

    let entries = pipeline.run_files(&files, input.path(), &PatientMetadata::default());
    let names: Vec<&str> = entries.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, ["broken", "left__scan", "right__scan"]);

    let (_, broken) = &entries[0];
    assert!(!broken.success);
    assert_eq!(broken.run_id, "load_001");
    let err = broken.error().unwrap();
    assert_eq!(err.stage, STAGE_LOAD);
    assert_eq!(err.kind, "ImageError");

    assert!(entries[1].1.success && entries[2].1.success);
    assert_eq!(entries[1].1.run_id, "batch_001");
    assert_eq!(entries[2].1.run_id, "batch_002");
}

#[test]
fn malformed_resources_fail_init_with_load_errors() {
    if std::env::var(cephalometric_rust_lib::config::DATA_DIR_ENV).is_ok() {
        return;
    }
    let config_for = |dir: &tempfile::TempDir| Config {
        config_dir: dir.path().to_string_lossy().into_owned(),
        ..Config::default()
    };
    let image = radiograph(200, 200, 0);
    let meta = PatientMetadata::default();

    let dir = resource_dir(&radiograph(800, 600, 0));
    let mut partial = template();
    partial.remove(Landmark::Go);
    write_shape(dir.path(), "mean_shape.json", &ReferenceShape::new(partial));
    let result = CephalometricPipeline::new(config_for(&dir)).run(&image, &meta, None, None);
    let err = result.error().unwrap();
    assert_eq!(err.kind, "ConfigLoadError");
    assert_eq!(err.stage, "init");
    assert!(err.message.contains("Go"));

    let dir = resource_dir(&radiograph(800, 600, 0));
    let ranges = r#"{"metrics": {"SNA": {"normal_range": [80, 84]}}}"#;
    fs::write(dir.path().join("normal_ranges.json"), ranges).unwrap();
    let result = CephalometricPipeline::new(config_for(&dir)).run(&image, &meta, None, None);
    let err = result.error().unwrap();
    assert_eq!(err.kind, "ConfigLoadError");
    assert_eq!(err.stage, "init");
}
