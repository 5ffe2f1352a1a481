//! Error taxonomy for the OCR pipeline.
//!
//! Each pipeline stage produces its own error kinds and propagates them to
//! the caller; nothing is swallowed into a print statement. The binary maps
//! every kind to a distinct process exit code so automated callers can tell
//! failures apart while the message stays human-readable.

use crate::resolve::supported_extensions_list;
use std::path::PathBuf;
use thiserror::Error;

/// Boxed error source carried by [`OcrError::ModelLoad`] and
/// [`OcrError::Inference`].
pub type BoxedError = Box<dyn std::error::Error + Send + Sync>;

/// All failure kinds the pipeline can report.
#[derive(Debug, Error)]
pub enum OcrError {
    /// Auto-discovery scanned the working directory and found no candidate.
    #[error(
        "no image found in {}: place a supported image there or pass a path (supported formats: {})",
        .dir.display(),
        supported_extensions_list()
    )]
    NoImageFound { dir: PathBuf },

    /// A user-specified image path does not exist.
    #[error("image not found: {}: check the configured image path", .path.display())]
    ImageNotFound { path: PathBuf },

    /// A user-specified image has an extension outside the supported set.
    #[error(
        "unsupported image format \"{extension}\" for {}: supported formats are {}",
        .path.display(),
        supported_extensions_list()
    )]
    UnsupportedFormat { path: PathBuf, extension: String },

    /// Acquiring the processor/model pair failed. Fatal, never retried.
    #[error("failed to load model {model_id}: {source}")]
    ModelLoad {
        model_id: String,
        #[source]
        source: BoxedError,
    },

    /// Any failure between prompt encoding and writing the sidecar file.
    #[error("inference failed: {source}")]
    Inference {
        #[source]
        source: BoxedError,
    },
}

impl OcrError {
    pub fn model_load(model_id: impl Into<String>, source: impl Into<BoxedError>) -> Self {
        Self::ModelLoad {
            model_id: model_id.into(),
            source: source.into(),
        }
    }

    pub fn inference(source: impl Into<BoxedError>) -> Self {
        Self::Inference {
            source: source.into(),
        }
    }

    /// Process exit code for this error kind.
    ///
    /// Code 1 is left to the runtime so a panic remains distinguishable from
    /// a handled failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::NoImageFound { .. } => 2,
            Self::ImageNotFound { .. } => 3,
            Self::UnsupportedFormat { .. } => 4,
            Self::ModelLoad { .. } => 5,
            Self::Inference { .. } => 6,
        }
    }
}
