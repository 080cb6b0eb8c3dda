use std::fs;
use std::path::{Component, Path, PathBuf};
use image::DynamicImage;

use crate::errors::{CephError, Result};

/// Extensions accepted as radiograph input
pub const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Represents an input image with its metadata
pub struct InputImage {
    pub image: DynamicImage,
    pub path: PathBuf,
    pub filename: String,
}

pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Get all PNG/JPEG files from a directory (recursively), sorted by path
pub fn get_image_files_in_dir<P: AsRef<Path>>(dir_path: P) -> Result<Vec<PathBuf>> {
    let dir_path = dir_path.as_ref();

    if !dir_path.exists() {
        return Err(CephError::InvalidPath(dir_path.to_path_buf()));
    }

    if !dir_path.is_dir() {
        return Err(CephError::Config(format!(
            "{} is not a directory", dir_path.display()
        )));
    }

    let mut files = Vec::new();
    find_image_files_recursive(dir_path, &mut files)?;
    files.sort();

    Ok(files)
}

fn find_image_files_recursive(dir_path: &Path, result: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir_path)? {
        let path = entry?.path();

        if path.is_dir() {
            find_image_files_recursive(&path, result)?;
        } else if path.is_file() && is_supported_image(&path) {
            result.push(path);
        }
    }

    Ok(())
}

/// Output file name for `path` found under `root`: the relative path without
/// extension, directories joined by `__`, so equal stems in different
/// subdirectories stay distinct.
pub fn output_name(path: &Path, root: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path).with_extension("");
    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    parts.join("__")
}

/// Load an image in whatever color mode it is stored in
pub fn load_image<P: AsRef<Path>>(path: P) -> Result<InputImage> {
    let path = path.as_ref();

    let filename = path.file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| CephError::InvalidPath(path.to_path_buf()))?
        .to_string();

    let image = image::open(path)?;

    Ok(InputImage {
        image,
        path: path.to_path_buf(),
        filename,
    })
}
