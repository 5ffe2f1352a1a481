//! Model acquisition from the Hugging Face hub or a local checkout.

use crate::backend::glm::{GlmArtifacts, GlmOcrEngine};
use crate::backend::{ModelAcquirer, ModelHandle, auto_device};
use crate::error::{BoxedError, OcrError};
use hf_hub::api::sync::ApiBuilder;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Fetches model files through the hub cache, or straight from disk when the
/// identifier names an existing directory.
#[derive(Debug, Default)]
pub struct HubAcquirer;

impl HubAcquirer {
    pub fn new() -> Self {
        Self
    }

    fn locate(&self, model_id: &str) -> Result<GlmArtifacts, BoxedError> {
        let local = Path::new(model_id);
        if local.is_dir() {
            info!("using local model directory: {}", local.display());
            return Ok(GlmArtifacts::in_dir(local));
        }

        let api = ApiBuilder::new()
            .with_progress(true)
            .with_token(std::env::var("HF_TOKEN").ok())
            .build()?;
        let repo = api.model(model_id.to_string());
        Ok(GlmArtifacts {
            config: repo.get("config.json")?,
            preprocessor: repo.get("preprocessor_config.json")?,
            tokenizer: repo.get("tokenizer.json")?,
            weights: repo.get("model.safetensors")?,
        })
    }
}

impl ModelAcquirer for HubAcquirer {
    fn acquire(&self, model_id: &str) -> Result<ModelHandle, OcrError> {
        let handle = (|| -> Result<ModelHandle, BoxedError> {
            let artifacts = self.locate(model_id)?;
            let device = auto_device()?;
            let engine = GlmOcrEngine::load(&artifacts, device)?;
            let engine = Arc::new(engine);
            Ok(ModelHandle::new(engine.clone(), engine, model_id))
        })();
        handle.map_err(|e| OcrError::model_load(model_id, e))
    }
}
