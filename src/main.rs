use std::path::{Path, PathBuf};
use std::time::Instant;
use std::fs;
use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};

use cephalometric_rust_lib::config::Config;
use cephalometric_rust_lib::estimator::Anchors;
use cephalometric_rust_lib::image_io::{get_image_files_in_dir, load_image};
use cephalometric_rust_lib::landmarks::Point;
use cephalometric_rust_lib::norms::Sex;
use cephalometric_rust_lib::output::{write_landmarks_csv, write_result_json, write_summary_csv};
use cephalometric_rust_lib::{CephalometricPipeline, PatientMetadata};

/// Command-line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about = "Cephalometric landmark, metric and malocclusion analysis")]
struct Args {
    /// Path to input file or directory
    #[clap(short, long)]
    input: Option<String>,

    /// Path to output directory
    #[clap(short, long)]
    output: Option<String>,

    /// Path to configuration file (defaults are used when it does not exist)
    #[clap(short, long, default_value = "config.toml")]
    config: String,

    /// Patient age in years
    #[clap(long)]
    age: Option<u32>,

    /// Patient sex: M, F or U
    #[clap(long)]
    sex: Option<Sex>,

    /// Orbitale anchor in pixels, as X,Y
    #[clap(long, value_parser = parse_point, requires = "anchor_po")]
    anchor_or: Option<Point>,

    /// Porion anchor in pixels, as X,Y
    #[clap(long, value_parser = parse_point, requires = "anchor_or")]
    anchor_po: Option<Point>,

    /// Random seed (overwrites config)
    #[clap(long)]
    seed: Option<u64>,

    /// Enable debug logging
    #[clap(short, long)]
    debug: bool,
}

fn parse_point(value: &str) -> std::result::Result<Point, String> {
    let (x, y) = value
        .split_once(',')
        .ok_or_else(|| format!("expected X,Y but got '{}'", value))?;
    let x: f64 = x.trim().parse().map_err(|e| format!("invalid X '{}': {}", x, e))?;
    let y: f64 = y.trim().parse().map_err(|e| format!("invalid Y '{}': {}", y, e))?;
    let point = Point::new(x, y);
    if !point.is_finite() {
        return Err(format!("coordinates must be finite, got '{}'", value));
    }
    Ok(point)
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let mut config = if Path::new(&args.config).exists() {
        Config::from_file(&args.config).with_context(|| format!("loading {}", args.config))?
    } else {
        warn!("Config file {} not found, using defaults", args.config);
        Config::default()
    };

    // Override config with command-line arguments
    if let Some(input) = args.input.clone() {
        config.input_path = input;
    }

    if let Some(output) = args.output.clone() {
        config.output_base_dir = output;
    }

    if let Some(seed) = args.seed {
        config.seed = seed;
    }

    config.validate()?;

    let metadata = PatientMetadata::new(
        args.age.unwrap_or(PatientMetadata::default().age),
        args.sex.unwrap_or_default(),
    );
    let anchors = match (args.anchor_or, args.anchor_po) {
        (Some(orbitale), Some(porion)) => Some(Anchors { orbitale, porion }),
        _ => None,
    };

    let start_time = Instant::now();

    let output_base = PathBuf::from(&config.output_base_dir);
    fs::create_dir_all(&output_base)
        .with_context(|| format!("creating output directory {}", output_base.display()))?;

    let pipeline = CephalometricPipeline::new(config.clone());
    let input_path = PathBuf::from(&config.input_path);

    if input_path.is_file() {
        info!("Processing single file: {}", input_path.display());
        let input_image = load_image(&input_path)?;
        let result = pipeline.run(&input_image.image, &metadata, anchors.as_ref(), None);

        let json_path = write_result_json(&result, &output_base, &input_image.filename)?;
        info!("Result written to {}", json_path.display());

        match result.analysis() {
            Some(analysis) => {
                write_landmarks_csv(&result, &output_base, &input_image.filename)?;
                info!(
                    "{}: {} ({:.1}%), ANB {:.2}°, quality {:.3}",
                    input_image.filename,
                    analysis.classification.predicted_class,
                    analysis.classification.confidence * 100.0,
                    analysis.clinical_metrics.anb.value,
                    analysis.quality.overall_score
                );
            }
            None => {
                if let Some(err) = result.error() {
                    bail!("{} failed at {}: {}", input_image.filename, err.stage, err.message);
                }
            }
        }
    } else if input_path.is_dir() {
        info!("Processing directory: {}", input_path.display());
        if anchors.is_some() {
            warn!("Anchors apply to single-file runs only and are ignored for directories");
        }

        let files = get_image_files_in_dir(&input_path)?;
        info!("Found {} image files", files.len());

        let entries = pipeline.run_files(&files, &input_path, &metadata);
        for (name, result) in &entries {
            write_result_json(result, &output_base, name)?;
            if result.success {
                write_landmarks_csv(result, &output_base, name)?;
            }
        }

        let summary_path = write_summary_csv(&entries, &output_base)?;
        info!("Summary written to {}", summary_path.display());
    } else {
        bail!("Input path does not exist: {}", input_path.display());
    }

    let elapsed = start_time.elapsed();
    info!("Processing completed in {:.2} seconds", elapsed.as_secs_f64());

    Ok(())
}
