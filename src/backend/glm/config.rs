//! Deserialized model configuration.
//!
//! Field sets follow the `config.json` / `preprocessor_config.json` shipped
//! with the model; keys the engine never reads are left out and ignored
//! during parsing.

use crate::error::BoxedError;
use candle_nn::Activation;
use serde::Deserialize;
use std::path::Path;

fn default_true() -> bool {
    true
}

fn default_rescale_factor() -> f32 {
    1.0 / 255.0
}

fn default_partial_rotary_factor() -> f64 {
    1.0
}

fn default_rope_theta() -> f64 {
    10000.0
}

fn default_in_channels() -> usize {
    3
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlmRopeParameters {
    pub rope_type: String,
    pub mrope_section: Vec<usize>,
    #[serde(default = "default_partial_rotary_factor")]
    pub partial_rotary_factor: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
}

/// `eos_token_id` appears as a scalar or a list depending on the export.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EosTokenIds {
    Single(u32),
    Multiple(Vec<u32>),
}

impl EosTokenIds {
    pub fn to_vec(&self) -> Vec<u32> {
        match self {
            Self::Single(v) => vec![*v],
            Self::Multiple(v) => v.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlmTextConfig {
    pub vocab_size: usize,
    pub eos_token_id: EosTokenIds,
    pub attention_bias: bool,
    pub head_dim: usize,
    pub hidden_act: Activation,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub max_position_embeddings: usize,
    pub num_attention_heads: usize,
    pub num_hidden_layers: usize,
    pub num_key_value_heads: usize,
    pub rms_norm_eps: f64,
    pub rope_parameters: GlmRopeParameters,
    #[serde(default)]
    pub tie_word_embeddings: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlmVisionConfig {
    pub hidden_size: usize,
    pub depth: usize,
    pub num_heads: usize,
    pub attention_bias: bool,
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,
    pub intermediate_size: usize,
    pub hidden_act: Activation,
    pub patch_size: usize,
    pub out_hidden_size: usize,
    pub rms_norm_eps: f64,
    pub spatial_merge_size: usize,
    pub temporal_patch_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlmConfig {
    pub text_config: GlmTextConfig,
    pub vision_config: GlmVisionConfig,
    pub image_token_id: u32,
    #[serde(default)]
    pub tie_word_embeddings: bool,
}

impl GlmConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, BoxedError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents)
            .map_err(|e| format!("failed to parse {}: {e}", path.display()).into())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageProcessorSize {
    pub shortest_edge: u32,
    pub longest_edge: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlmImageProcessorConfig {
    pub size: ImageProcessorSize,
    #[serde(default = "default_true")]
    pub do_resize: bool,
    #[serde(default = "default_true")]
    pub do_rescale: bool,
    #[serde(default = "default_true")]
    pub do_normalize: bool,
    #[serde(default = "default_rescale_factor")]
    pub rescale_factor: f32,
    #[serde(default)]
    pub resample: Option<u32>,
    pub patch_size: usize,
    pub temporal_patch_size: usize,
    pub merge_size: usize,
    pub image_mean: Vec<f32>,
    pub image_std: Vec<f32>,
}

impl GlmImageProcessorConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, BoxedError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents)
            .map_err(|e| format!("failed to parse {}: {e}", path.display()).into())
    }

    /// Sanity checks, including agreement with the vision tower the patches
    /// are destined for.
    pub fn validate(&self, vision: &GlmVisionConfig) -> Result<(), BoxedError> {
        if self.image_mean.len() != 3 || self.image_std.len() != 3 {
            return Err(format!(
                "image_mean/image_std must have length 3, got mean={} std={}",
                self.image_mean.len(),
                self.image_std.len()
            )
            .into());
        }
        if self.image_std.contains(&0.0) {
            return Err("image_std values must be non-zero (used as divisor)".into());
        }
        if self.patch_size == 0 || self.merge_size == 0 || self.temporal_patch_size == 0 {
            return Err("patch_size, merge_size and temporal_patch_size must be > 0".into());
        }
        if self.size.shortest_edge == 0 || self.size.longest_edge < self.size.shortest_edge {
            return Err("size.shortest_edge must be > 0 and <= size.longest_edge".into());
        }
        if self.patch_size != vision.patch_size
            || self.temporal_patch_size != vision.temporal_patch_size
            || self.merge_size != vision.spatial_merge_size
        {
            return Err(format!(
                "preprocessor patch geometry ({}, {}, {}) disagrees with the vision config ({}, {}, {})",
                self.patch_size,
                self.temporal_patch_size,
                self.merge_size,
                vision.patch_size,
                vision.temporal_patch_size,
                vision.spatial_merge_size
            )
            .into());
        }
        Ok(())
    }
}
