//! Source patch sets stored under `<firmware path>/patches/`

use std::path::{Component, Path, PathBuf};

use crate::errors::{LabError, Result};
use crate::models::{BuildTarget, Patch};

pub const PATCHES_DIR: &str = "patches";

/// `.patch` files available for a target, sorted by file name
pub fn list_patches(repo_root: &Path, target: &BuildTarget) -> Vec<Patch> {
    let firmware_path = target.path.trim();
    if firmware_path.is_empty() {
        return Vec::new();
    }
    let dir = repo_root.join(firmware_path).join(PATCHES_DIR);
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return Vec::new();
    };

    let mut names: Vec<String> = entries
        .flatten()
        .filter(|entry| entry.path().is_file())
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .filter(|name| name.ends_with(".patch"))
        .collect();
    names.sort();

    names
        .into_iter()
        .map(|name| Patch {
            path: format!("{}/{}", PATCHES_DIR, name),
            name,
        })
        .collect()
}

/// Absolute location of a selected patch. The relative path must stay inside
/// the firmware source tree and point at an existing file.
pub fn resolve_patch(repo_root: &Path, target: &BuildTarget, relative: &str) -> Result<PathBuf> {
    let rel = Path::new(relative.trim());
    let escapes = rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if relative.trim().is_empty() || escapes {
        return Err(LabError::Validation(format!("Invalid patch path: {}", relative)));
    }
    let absolute = repo_root.join(target.path.trim()).join(rel);
    if !absolute.is_file() {
        return Err(LabError::Validation(format!("Patch not found: {}", relative)));
    }
    Ok(absolute)
}
