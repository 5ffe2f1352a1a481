//! # GLM OCR
//!
//! A Rust OCR tool that extracts text from a single image using the GLM
//! vision-language model, running locally on the candle tensor stack.
//!
//! ## Features
//!
//! - One-shot OCR over a given image, or auto-discovery of the first
//!   supported image in the working directory
//! - Automatic model download from the Hugging Face hub, with local
//!   checkouts accepted in place of a hub identifier
//! - Greedy decoding with the prompt stripped from the output, special
//!   tokens preserved
//! - A `<stem>_ocr.txt` sidecar next to the framed console report
//!
//! ## Modules
//!
//! * [`config`] - Run parameters and their defaults
//! * [`resolve`] - Input image lookup and format validation
//! * [`device`] - Diagnostic compute-backend probing
//! * [`chat`] - The fixed OCR chat request
//! * [`backend`] - Capability traits plus the bundled GLM engine
//! * [`pipeline`] - The end-to-end run
//! * [`persist`] - Console framing and the sidecar file
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use glm_ocr::{RunConfig, run};
//!
//! # fn main() -> Result<(), glm_ocr::OcrError> {
//! let config = RunConfig {
//!     image_path: Some("document.jpg".into()),
//!     ..RunConfig::default()
//! };
//! let outcome = run(&config)?;
//! println!("saved to {}", outcome.output.display());
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod chat;
pub mod config;
pub mod device;
pub mod error;
pub mod persist;
pub mod pipeline;
pub mod resolve;

pub use config::{DEFAULT_MODEL_ID, MAX_NEW_TOKENS, RunConfig};
pub use device::DeviceTag;
pub use error::OcrError;
pub use pipeline::{RunOutcome, run, run_with};
pub use resolve::ImageReference;

/// Initializes the tracing subscriber for logging.
///
/// This function sets up the tracing subscriber with environment filter and formatting layer.
/// It's typically called at the start of an application to enable logging.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();
}
