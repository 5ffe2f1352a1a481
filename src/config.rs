//! Pipeline configuration.
//!
//! An explicit struct passed to the entry point rather than module-level
//! constants; validated once at startup.

use crate::error::OcrError;
use std::path::PathBuf;

/// Model identifier used when none is configured.
pub const DEFAULT_MODEL_ID: &str = "zai-org/GLM-OCR";

/// Upper bound on newly generated tokens per run.
pub const MAX_NEW_TOKENS: usize = 8192;

/// Everything a single run needs to know.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    /// Image to read. `None` (or an empty path) triggers auto-discovery in
    /// the working directory.
    pub image_path: Option<PathBuf>,
    /// Hub-style `namespace/model-name` identifier, or a local model
    /// directory.
    pub model_id: String,
    /// Upper bound on newly generated tokens.
    pub max_new_tokens: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            image_path: None,
            model_id: DEFAULT_MODEL_ID.to_string(),
            max_new_tokens: MAX_NEW_TOKENS,
        }
    }
}

impl RunConfig {
    pub(crate) fn validate(&self) -> Result<(), OcrError> {
        if self.model_id.trim().is_empty() {
            return Err(OcrError::model_load(
                self.model_id.clone(),
                "model identifier is empty",
            ));
        }
        Ok(())
    }
}
