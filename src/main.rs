//! Command-line entry point for one-shot OCR.

use clap::Parser;
use glm_ocr::{DEFAULT_MODEL_ID, MAX_NEW_TOKENS, RunConfig, init_tracing, run};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;

#[derive(Parser, Debug)]
#[command(name = "glm-ocr")]
#[command(about = "Extract text from an image with the GLM vision-language model")]
struct Args {
    /// Input image path; when omitted, the first supported image in the
    /// current directory is used
    #[arg(value_name = "IMAGE")]
    image: Option<PathBuf>,

    /// Hugging Face model identifier or a local model directory
    #[arg(long, default_value = DEFAULT_MODEL_ID)]
    model_id: String,

    /// Maximum number of generated tokens
    #[arg(long, default_value_t = MAX_NEW_TOKENS)]
    max_new_tokens: usize,
}

fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();

    let config = RunConfig {
        image_path: args.image,
        model_id: args.model_id,
        max_new_tokens: args.max_new_tokens,
    };
    match run(&config) {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::from(err.exit_code())
        }
    }
}
