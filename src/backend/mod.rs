//! Model backend abstractions.
//!
//! The pipeline talks to the model through three small traits so that the
//! recognition flow stays independent of any particular runtime:
//!
//! - [`ChatProcessor`] renders chat messages into tensors and decodes token
//!   ids back into text.
//! - [`GenerationModel`] runs autoregressive generation over encoded inputs.
//! - [`ModelAcquirer`] obtains both, downloading or loading artifacts as
//!   needed.
//!
//! [`glm`] provides the bundled implementation on top of candle; [`hub`]
//! resolves model identifiers to local artifact directories.

pub mod glm;
pub mod hub;

pub use hub::HubAcquirer;

use crate::chat::ChatMessage;
use crate::error::OcrError;
use candle_core::{Device, Tensor};
use std::collections::HashMap;
use std::sync::Arc;

/// Token ids of the rendered prompt, shape `(batch, seq)`.
pub const INPUT_IDS: &str = "input_ids";
/// Segment ids some processors emit; the pipeline drops this field before
/// generation.
pub const TOKEN_TYPE_IDS: &str = "token_type_ids";
/// Flattened image patches, shape `(patches, patch_dim)`.
pub const PIXEL_VALUES: &str = "pixel_values";
/// Per-image `(temporal, height, width)` patch grid, shape `(images, 3)`.
pub const IMAGE_GRID_THW: &str = "image_grid_thw";

/// Named tensors produced by a [`ChatProcessor`].
///
/// Mirrors the keyed batch a multimodal processor returns: every field is
/// addressed by name so callers can remove entries the model does not accept.
#[derive(Debug, Clone, Default)]
pub struct EncodedInputs {
    fields: HashMap<String, Tensor>,
}

impl EncodedInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.fields.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.fields.get(name)
    }

    /// Removes a field, returning it if present.
    pub fn remove(&mut self, name: &str) -> Option<Tensor> {
        self.fields.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Length of the encoded prompt in tokens.
    pub fn sequence_len(&self) -> Result<usize, OcrError> {
        let input_ids = self
            .get(INPUT_IDS)
            .ok_or_else(|| OcrError::inference("encoded inputs are missing input_ids"))?;
        match input_ids.dims().last() {
            Some(&len) => Ok(len),
            None => Err(OcrError::inference("input_ids tensor has no dimensions")),
        }
    }
}

/// Token sequences produced by generation, one per batch row.
///
/// Each sequence contains the prompt followed by the generated continuation,
/// matching what the model consumed and emitted end to end.
#[derive(Debug, Clone, Default)]
pub struct GeneratedSequence {
    sequences: Vec<Vec<u32>>,
}

impl GeneratedSequence {
    pub fn new(sequences: Vec<Vec<u32>>) -> Self {
        Self { sequences }
    }

    /// The first (and for this pipeline, only) sequence.
    pub fn first(&self) -> Option<&[u32]> {
        self.sequences.first().map(Vec::as_slice)
    }
}

/// Renders chat messages to tensors and token ids back to text.
pub trait ChatProcessor {
    /// Applies the model's chat template and tokenizes the result, loading
    /// and preprocessing any referenced images.
    fn encode_chat(&self, messages: &[ChatMessage]) -> Result<EncodedInputs, OcrError>;

    /// Decodes token ids into text. With `skip_special_tokens` false the
    /// output preserves template markers such as end-of-turn tags.
    fn decode(&self, tokens: &[u32], skip_special_tokens: bool) -> Result<String, OcrError>;
}

/// Runs autoregressive generation.
pub trait GenerationModel {
    /// Generates up to `max_new_tokens` tokens, stopping early at an
    /// end-of-sequence token. The returned sequences include the prompt.
    fn generate(
        &self,
        inputs: &EncodedInputs,
        max_new_tokens: usize,
    ) -> Result<GeneratedSequence, OcrError>;
}

/// A loaded model paired with its processor.
///
/// Both halves are present by construction; acquisition either yields a
/// complete handle or an error. The bundled engine relies on interior
/// mutability for its decode cache, so a handle stays on the thread that
/// created it.
#[derive(Clone)]
pub struct ModelHandle {
    processor: Arc<dyn ChatProcessor>,
    model: Arc<dyn GenerationModel>,
    model_id: String,
}

impl ModelHandle {
    pub fn new(
        processor: Arc<dyn ChatProcessor>,
        model: Arc<dyn GenerationModel>,
        model_id: impl Into<String>,
    ) -> Self {
        Self {
            processor,
            model,
            model_id: model_id.into(),
        }
    }

    pub fn processor(&self) -> &dyn ChatProcessor {
        self.processor.as_ref()
    }

    pub fn model(&self) -> &dyn GenerationModel {
        self.model.as_ref()
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("model_id", &self.model_id)
            .finish_non_exhaustive()
    }
}

/// Loads the model artifacts for an identifier and constructs a handle.
pub trait ModelAcquirer {
    fn acquire(&self, model_id: &str) -> Result<ModelHandle, OcrError>;
}

/// Picks the best compute device available: CUDA, then Metal, then CPU.
///
/// Independent of [`crate::device::DeviceTag`], which only reports; this is
/// where placement actually happens.
pub fn auto_device() -> candle_core::Result<Device> {
    if candle_core::utils::cuda_is_available() {
        Device::new_cuda(0)
    } else if candle_core::utils::metal_is_available() {
        Device::new_metal(0)
    } else {
        Ok(Device::Cpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(tokens: &[u32]) -> Tensor {
        Tensor::from_vec(tokens.to_vec(), (1, tokens.len()), &Device::Cpu).unwrap()
    }

    #[test]
    fn sequence_len_reads_the_last_dimension() {
        let mut inputs = EncodedInputs::new();
        inputs.insert(INPUT_IDS, ids(&[11, 12, 13, 14]));
        assert_eq!(inputs.sequence_len().unwrap(), 4);
    }

    #[test]
    fn sequence_len_requires_input_ids() {
        let inputs = EncodedInputs::new();
        let err = inputs.sequence_len().unwrap_err();
        assert!(matches!(err, OcrError::Inference { .. }));
    }

    #[test]
    fn remove_drops_the_field() {
        let mut inputs = EncodedInputs::new();
        inputs.insert(TOKEN_TYPE_IDS, ids(&[0, 0, 0]));
        assert!(inputs.contains(TOKEN_TYPE_IDS));
        assert!(inputs.remove(TOKEN_TYPE_IDS).is_some());
        assert!(!inputs.contains(TOKEN_TYPE_IDS));
        assert!(inputs.remove(TOKEN_TYPE_IDS).is_none());
    }

    #[test]
    fn first_sequence_is_returned_as_a_slice() {
        let generated = GeneratedSequence::new(vec![vec![1, 2, 3]]);
        assert_eq!(generated.first(), Some([1, 2, 3].as_slice()));
        assert_eq!(GeneratedSequence::default().first(), None);
    }
}
