//! GLM vision-language implementation of the backend capability traits.

mod attention;
mod config;
mod engine;
mod processing;
mod text;
mod vision;

pub use config::{
    GlmConfig, GlmImageProcessorConfig, GlmRopeParameters, GlmTextConfig, GlmVisionConfig,
};
pub use engine::{GlmArtifacts, GlmOcrEngine};
