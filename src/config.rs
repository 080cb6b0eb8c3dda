// Pipeline configuration loaded from TOML

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::{CephError, Result};

/// Environment variable that overrides `config_dir` at pipeline construction.
pub const DATA_DIR_ENV: &str = "CEPH_DATA_DIR";

/// Configuration for the cephalometric pipeline
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Config {
    #[serde(default = "default_input_path")]
    pub input_path: String,

    #[serde(default = "default_output_base_dir")]
    pub output_base_dir: String,

    // Reference data resources
    #[serde(default = "default_config_dir")]
    pub config_dir: String,

    #[serde(default = "default_canonical_shape_file")]
    pub canonical_shape_file: String,

    #[serde(default = "default_mean_shape_file")]
    pub mean_shape_file: String,

    #[serde(default = "default_normal_ranges_file")]
    pub normal_ranges_file: String,

    /// Fall back to the built-in normal-range table when the resource is absent
    #[serde(default = "default_allow_default_normal_ranges")]
    pub allow_default_normal_ranges: bool,

    // Reproducibility
    #[serde(default = "default_seed")]
    pub seed: u64,

    // Input validation
    #[serde(default = "default_min_image_dimension")]
    pub min_image_dimension: u32,

    // Landmark estimation
    #[serde(default = "default_clamp_margin_px")]
    pub clamp_margin_px: f64,

    #[serde(default = "default_jitter_base_sigma")]
    pub jitter_base_sigma: f64,

    /// Side length of the grayscale downsample used for content hashing
    #[serde(default = "default_hash_resolution")]
    pub hash_resolution: u32,

    #[serde(default = "default_parallel")]
    pub use_parallel: bool,
}

fn default_input_path() -> String {
    "./input".to_string()
}

fn default_output_base_dir() -> String {
    "./output".to_string()
}

fn default_config_dir() -> String {
    "data/clinical_standards".to_string()
}

fn default_canonical_shape_file() -> String {
    "demo_landmarks.json".to_string()
}

fn default_mean_shape_file() -> String {
    "mean_shape.json".to_string()
}

fn default_normal_ranges_file() -> String {
    "normal_ranges.json".to_string()
}

fn default_allow_default_normal_ranges() -> bool {
    true
}

fn default_seed() -> u64 {
    42
}

fn default_min_image_dimension() -> u32 {
    100
}

fn default_clamp_margin_px() -> f64 {
    1.0
}

fn default_jitter_base_sigma() -> f64 {
    1.5
}

fn default_hash_resolution() -> u32 {
    256
}

fn default_parallel() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            input_path: default_input_path(),
            output_base_dir: default_output_base_dir(),
            config_dir: default_config_dir(),
            canonical_shape_file: default_canonical_shape_file(),
            mean_shape_file: default_mean_shape_file(),
            normal_ranges_file: default_normal_ranges_file(),
            allow_default_normal_ranges: default_allow_default_normal_ranges(),
            seed: default_seed(),
            min_image_dimension: default_min_image_dimension(),
            clamp_margin_px: default_clamp_margin_px(),
            jitter_base_sigma: default_jitter_base_sigma(),
            hash_resolution: default_hash_resolution(),
            use_parallel: default_parallel(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            CephError::Config(format!("Failed to read config file '{}': {}", path.display(), e))
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| {
            CephError::Config(format!("Failed to parse config file '{}': {}", path.display(), e))
        })?;

        Ok(config)
    }

    /// Directory holding the reference resources, honoring `CEPH_DATA_DIR`.
    pub fn resolved_config_dir(&self) -> PathBuf {
        match env::var(DATA_DIR_ENV) {
            Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ => PathBuf::from(&self.config_dir),
        }
    }

    pub fn canonical_shape_path(&self) -> PathBuf {
        self.resolved_config_dir().join(&self.canonical_shape_file)
    }

    pub fn mean_shape_path(&self) -> PathBuf {
        self.resolved_config_dir().join(&self.mean_shape_file)
    }

    pub fn normal_ranges_path(&self) -> PathBuf {
        self.resolved_config_dir().join(&self.normal_ranges_file)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.config_dir.trim().is_empty() {
            return Err(CephError::Config("config_dir must not be empty".to_string()));
        }

        if self.min_image_dimension == 0 {
            return Err(CephError::Config(
                "min_image_dimension must be > 0".to_string(),
            ));
        }

        if !(self.clamp_margin_px >= 0.0) {
            return Err(CephError::Config(
                "clamp_margin_px must be >= 0.0".to_string(),
            ));
        }

        if self.clamp_margin_px * 2.0 >= self.min_image_dimension as f64 {
            return Err(CephError::Config(
                "clamp_margin_px must be smaller than half of min_image_dimension".to_string(),
            ));
        }

        if !(self.jitter_base_sigma >= 0.0) {
            return Err(CephError::Config(
                "jitter_base_sigma must be >= 0.0".to_string(),
            ));
        }

        if self.hash_resolution == 0 {
            return Err(CephError::Config(
                "hash_resolution must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| {
            CephError::Config(format!("Failed to serialize config: {}", e))
        })?;

        fs::write(path, content)?;

        Ok(())
    }
}
