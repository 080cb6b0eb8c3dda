use image::{DynamicImage, GrayImage};
use imageproc::gradients::sobel_gradients;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Gray level below which a pixel counts as dark
pub const DARK_THRESHOLD: u8 = 50;
/// Gray level above which a pixel counts as bright
pub const BRIGHT_THRESHOLD: u8 = 200;
/// Gain of the 3x3 Sobel kernel; divides the gradient magnitude back to gray-level units
const SOBEL_GAIN: f64 = 4.0;
/// Minimum side length for an image to look like a typical cephalogram
const TYPICAL_MIN_SIDE: u32 = 256;

/// Coarse statistics of an input image, computed once per inference call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImageDescriptor {
    pub width: u32,
    pub height: u32,
    pub aspect_ratio: f64,
    pub mean_brightness: f64,
    pub brightness_std: f64,
    /// Share of pixels darker than [`DARK_THRESHOLD`]
    pub dark_ratio: f64,
    /// Share of pixels brighter than [`BRIGHT_THRESHOLD`]
    pub bright_ratio: f64,
    /// Mean Sobel gradient magnitude in gray levels
    pub edge_intensity: f64,
    pub is_typical_radiograph: bool,
}

impl ImageDescriptor {
    pub fn from_image(image: &DynamicImage) -> Self {
        Self::from_gray(&image.to_luma8())
    }

    pub fn from_gray(gray: &GrayImage) -> Self {
        let (width, height) = gray.dimensions();
        let total = (width as f64) * (height as f64);

        let mut sum = 0.0;
        let mut sum_sq = 0.0;
        let mut dark = 0u64;
        let mut bright = 0u64;
        for pixel in gray.pixels() {
            let v = pixel[0];
            let f = v as f64;
            sum += f;
            sum_sq += f * f;
            if v < DARK_THRESHOLD {
                dark += 1;
            } else if v > BRIGHT_THRESHOLD {
                bright += 1;
            }
        }

        let (mean, std, dark_ratio, bright_ratio) = if total > 0.0 {
            let mean = sum / total;
            let variance = (sum_sq / total - mean * mean).max(0.0);
            (mean, variance.sqrt(), dark as f64 / total, bright as f64 / total)
        } else {
            (0.0, 0.0, 0.0, 0.0)
        };

        let aspect_ratio = if height > 0 { width as f64 / height as f64 } else { 0.0 };
        let is_typical_radiograph = (1.0..=2.0).contains(&aspect_ratio)
            && width.min(height) >= TYPICAL_MIN_SIDE;

        Self {
            width,
            height,
            aspect_ratio,
            mean_brightness: mean,
            brightness_std: std,
            dark_ratio,
            bright_ratio,
            edge_intensity: edge_intensity(gray),
            is_typical_radiograph,
        }
    }
}

/// Mean Sobel gradient magnitude, normalized to gray-level units.
pub fn edge_intensity(gray: &GrayImage) -> f64 {
    let (width, height) = gray.dimensions();
    if width < 3 || height < 3 {
        return 0.0;
    }

    let gradients = sobel_gradients(gray);
    let total: f64 = gradients.pixels().map(|p| p[0] as f64).sum();
    total / (width as f64 * height as f64) / SOBEL_GAIN
}

/// Resize a grayscale image to the specified dimensions
pub fn resize_image(image: &GrayImage, dimensions: [u32; 2]) -> GrayImage {
    let (width, height) = (dimensions[0], dimensions[1]);
    image::imageops::resize(image, width, height, image::imageops::FilterType::Triangle)
}

/// SHA-256 (lowercase hex) of the image rendered as a `resolution` x `resolution`
/// grayscale raster. Used for exact-match lookup of the canonical reference.
pub fn content_hash(image: &DynamicImage, resolution: u32) -> String {
    let normalized = resize_image(&image.to_luma8(), [resolution, resolution]);
    format!("{:x}", Sha256::digest(normalized.as_raw()))
}
