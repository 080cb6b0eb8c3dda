use std::fs;
use std::path::{Path, PathBuf};
use csv::Writer;

use crate::errors::{CephError, Result};
use crate::pipeline::PipelineResult;

fn prepare_output_path(output_dir: &Path, subdir: &str, file_name: String) -> Result<PathBuf> {
    let output_path = output_dir.join(subdir).join(file_name);

    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)?;
    }

    Ok(output_path)
}

/// Write the full run record as pretty JSON to `<output_dir>/results/<filename>.json`
pub fn write_result_json<P: AsRef<Path>>(
    result: &PipelineResult,
    output_dir: P,
    filename: &str,
) -> Result<PathBuf> {
    let file_name = format!("{}.json", filename);
    let output_path = prepare_output_path(output_dir.as_ref(), "results", file_name)?;

    let content = serde_json::to_string_pretty(result)?;
    fs::write(&output_path, content)?;

    Ok(output_path)
}

/// Write landmark coordinates to `<output_dir>/landmarks/<filename>.csv`.
/// Failed runs have no landmarks and are rejected.
pub fn write_landmarks_csv<P: AsRef<Path>>(
    result: &PipelineResult,
    output_dir: P,
    filename: &str,
) -> Result<PathBuf> {
    let analysis = result.analysis().ok_or_else(|| {
        CephError::Config(format!("Run {} has no landmarks to write", result.run_id))
    })?;

    let file_name = format!("{}.csv", filename);
    let output_path = prepare_output_path(output_dir.as_ref(), "landmarks", file_name)?;
    let mut writer = Writer::from_path(&output_path)?;

    writer.write_record(["Landmark", "X", "Y", "Inference_Mode"])?;

    for (landmark, point) in analysis.landmarks.coordinates.iter() {
        writer.write_record(&[
            landmark.name().to_string(),
            format!("{:.2}", point.x),
            format!("{:.2}", point.y),
            analysis.landmarks.inference_mode.as_str().to_string(),
        ])?;
    }

    writer.flush()?;

    Ok(output_path)
}

/// One row per run: id, source file, outcome, class, confidence, ANB and error.
pub fn write_summary_csv<P: AsRef<Path>>(
    entries: &[(String, PipelineResult)],
    output_dir: P,
) -> Result<PathBuf> {
    let output_dir = output_dir.as_ref();
    fs::create_dir_all(output_dir)?;
    let output_path = output_dir.join("summary.csv");

    let mut writer = Writer::from_path(&output_path)?;

    writer.write_record([
        "Run_ID",
        "File",
        "Success",
        "Class",
        "Confidence",
        "ANB",
        "Quality",
        "Error",
    ])?;

    for (file, result) in entries {
        let row = match (result.analysis(), result.error()) {
            (Some(analysis), _) => [
                result.run_id.clone(),
                file.clone(),
                "true".to_string(),
                analysis.classification.predicted_class.label().to_string(),
                format!("{:.3}", analysis.classification.confidence),
                format!("{:.2}", analysis.clinical_metrics.anb.value),
                format!("{:.3}", analysis.quality.overall_score),
                String::new(),
            ],
            (None, error) => [
                result.run_id.clone(),
                file.clone(),
                "false".to_string(),
                String::new(),
                String::new(),
                String::new(),
                String::new(),
                error
                    .map(|e| format!("{} ({}): {}", e.kind, e.stage, e.message))
                    .unwrap_or_default(),
            ],
        };
        writer.write_record(&row)?;
    }

    writer.flush()?;

    Ok(output_path)
}
