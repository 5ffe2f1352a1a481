//! Input resolution: turn an optional user-supplied path into a validated
//! [`ImageReference`], or auto-discover one in the working directory.

use crate::error::OcrError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Extensions accepted by the pipeline, lowercase and without the dot.
pub const SUPPORTED_EXTENSIONS: [&str; 7] = ["jpg", "jpeg", "png", "webp", "bmp", "tif", "tiff"];

pub(crate) fn supported_extensions_list() -> String {
    SUPPORTED_EXTENSIONS.join(", ")
}

/// A filesystem path that passed extension validation.
///
/// Created once at process start and never mutated afterwards; the prompt
/// builder and the output persister both borrow it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub path: PathBuf,
}

fn has_supported_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Resolve against the process working directory.
pub fn resolve(configured: Option<&Path>) -> Result<ImageReference, OcrError> {
    resolve_in(Path::new("."), configured)
}

/// Resolve an image, scanning `dir` when no path is configured.
///
/// A configured relative path is taken relative to `dir`; it must exist
/// and carry a supported extension. Without one, the first regular file
/// in directory-listing order with a supported extension wins.
pub fn resolve_in(dir: &Path, configured: Option<&Path>) -> Result<ImageReference, OcrError> {
    match configured {
        Some(configured) if !configured.as_os_str().is_empty() => {
            let path = if configured.is_absolute() {
                configured.to_path_buf()
            } else {
                dir.join(configured)
            };
            if !path.exists() {
                return Err(OcrError::ImageNotFound { path });
            }
            if !has_supported_extension(&path) {
                let extension = path
                    .extension()
                    .map(|ext| ext.to_string_lossy().into_owned())
                    .unwrap_or_default();
                return Err(OcrError::UnsupportedFormat { path, extension });
            }
            info!("using specified image: {}", path.display());
            Ok(ImageReference { path })
        }
        _ => {
            let entries = fs::read_dir(dir).map_err(|e| {
                debug!("cannot scan {}: {e}", dir.display());
                OcrError::NoImageFound {
                    dir: dir.to_path_buf(),
                }
            })?;
            for entry in entries.flatten() {
                let path = entry.path();
                let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
                if is_file && has_supported_extension(&path) {
                    info!("auto-detected image: {}", path.display());
                    return Ok(ImageReference { path });
                }
            }
            Err(OcrError::NoImageFound {
                dir: dir.to_path_buf(),
            })
        }
    }
}
