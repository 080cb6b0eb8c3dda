use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::errors::{CephError, Result};
use crate::landmarks::{Landmark, LandmarkSet};

/// A normalized (0..1) landmark template with optional provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceShape {
    /// SHA-256 of the normalized grayscale rendering of the source image
    #[serde(default, alias = "image_sha256", skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,

    /// Original pixel dimensions `[width, height]`
    #[serde(default, alias = "image_size", skip_serializing_if = "Option::is_none")]
    pub image_dimensions: Option<[u32; 2]>,

    pub landmarks: LandmarkSet,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ReferenceShape {
    pub fn new(landmarks: LandmarkSet) -> Self {
        Self {
            content_hash: None,
            image_dimensions: None,
            landmarks,
            description: None,
        }
    }

    /// Load a template resource. All 19 landmarks must be present and lie in [0, 1].
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| CephError::ConfigRead {
            source: e,
            path: path.to_path_buf(),
        })?;

        let shape: ReferenceShape =
            serde_json::from_str(&content).map_err(|e| CephError::ConfigLoad {
                source: e,
                path: path.to_path_buf(),
            })?;

        shape.validate().map_err(|reason| CephError::InvalidResource {
            path: path.to_path_buf(),
            reason,
        })?;

        Ok(shape)
    }

    /// Load a template that must carry a content hash for exact-match lookup.
    pub fn canonical_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let shape = Self::from_file(path)?;
        match shape.content_hash.as_deref() {
            Some(hash) if !hash.is_empty() => Ok(shape),
            _ => Err(CephError::InvalidResource {
                path: path.to_path_buf(),
                reason: "canonical shape has no content hash".to_string(),
            }),
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        let missing = self.landmarks.missing();
        if !missing.is_empty() {
            let names: Vec<&str> = missing.iter().map(|l| l.name()).collect();
            return Err(format!("missing landmarks: {}", names.join(", ")));
        }

        for landmark in Landmark::ALL {
            if let Some(p) = self.landmarks.get(landmark) {
                if !p.is_finite() {
                    return Err(format!("landmark {} has non-finite coordinates", landmark));
                }
                if !(0.0..=1.0).contains(&p.x) || !(0.0..=1.0).contains(&p.y) {
                    return Err(format!(
                        "landmark {} at ({}, {}) is outside the normalized range [0, 1]",
                        landmark, p.x, p.y
                    ));
                }
            }
        }

        if let Some([w, h]) = self.image_dimensions {
            if w == 0 || h == 0 {
                return Err(format!("image dimensions must be non-zero, got {}x{}", w, h));
            }
        }

        Ok(())
    }
}
