//! The end-to-end single-image run: resolve, load, infer, persist.

use crate::backend::{HubAcquirer, ModelAcquirer, ModelHandle, TOKEN_TYPE_IDS};
use crate::chat::ocr_request;
use crate::config::RunConfig;
use crate::device::DeviceTag;
use crate::error::OcrError;
use crate::persist::persist_in;
use crate::resolve::{ImageReference, resolve_in};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

/// Everything a completed run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub image: ImageReference,
    pub device: DeviceTag,
    pub output: PathBuf,
    pub text: String,
}

/// Runs OCR once in the current directory with the bundled hub acquirer.
pub fn run(config: &RunConfig) -> Result<RunOutcome, OcrError> {
    run_with(config, &HubAcquirer::new(), Path::new("."))
}

/// Runs OCR once against a caller-chosen acquirer and working directory.
pub fn run_with(
    config: &RunConfig,
    acquirer: &dyn ModelAcquirer,
    workdir: &Path,
) -> Result<RunOutcome, OcrError> {
    config.validate()?;
    let image = resolve_in(workdir, config.image_path.as_deref())?;

    let device = DeviceTag::detect();
    info!("detected device: {device}");

    info!(
        "loading model {} (the first run downloads it and may take a while)",
        config.model_id
    );
    let load_started = Instant::now();
    let handle = acquirer.acquire(&config.model_id)?;
    info!("model loaded in {:.1?}", load_started.elapsed());

    info!("analyzing image: {}", image.path.display());
    let text = infer(&handle, &image, config.max_new_tokens)?;

    let output = persist_in(workdir, &image, &text).map_err(OcrError::inference)?;
    Ok(RunOutcome {
        image,
        device,
        output,
        text,
    })
}

fn infer(
    handle: &ModelHandle,
    image: &ImageReference,
    max_new_tokens: usize,
) -> Result<String, OcrError> {
    let messages = ocr_request(image);
    let mut inputs = handle.processor().encode_chat(&messages)?;
    // The generator consumes ids, pixels and the grid; segment markers are
    // an encoder artifact it never reads.
    if inputs.remove(TOKEN_TYPE_IDS).is_some() {
        debug!("dropped {TOKEN_TYPE_IDS} from the encoded inputs");
    }
    let prompt_len = inputs.sequence_len()?;

    let started = Instant::now();
    let generated = handle.model().generate(&inputs, max_new_tokens)?;
    info!("generation finished in {:.1?}", started.elapsed());

    let sequence = generated
        .first()
        .ok_or_else(|| OcrError::inference("model returned no sequences"))?;
    // The sequence carries the prompt; only the generated suffix is text.
    let new_tokens = sequence.get(prompt_len..).unwrap_or_default();
    handle.processor().decode(new_tokens, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        ChatProcessor, EncodedInputs, GeneratedSequence, GenerationModel, INPUT_IDS, ModelAcquirer,
        TOKEN_TYPE_IDS,
    };
    use crate::chat::ChatMessage;
    use candle_core::{DType, Device, IndexOp, Tensor};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StubProcessor {
        prompt: Vec<u32>,
        with_token_type_ids: bool,
    }

    impl ChatProcessor for StubProcessor {
        fn encode_chat(&self, _messages: &[ChatMessage]) -> Result<EncodedInputs, OcrError> {
            let len = self.prompt.len();
            let mut inputs = EncodedInputs::new();
            inputs.insert(
                INPUT_IDS,
                Tensor::from_vec(self.prompt.clone(), (1, len), &Device::Cpu).unwrap(),
            );
            if self.with_token_type_ids {
                inputs.insert(
                    TOKEN_TYPE_IDS,
                    Tensor::zeros((1, len), DType::U32, &Device::Cpu).unwrap(),
                );
            }
            Ok(inputs)
        }

        fn decode(&self, tokens: &[u32], _skip_special_tokens: bool) -> Result<String, OcrError> {
            Ok(tokens.iter().map(|t| format!("<{t}>")).collect())
        }
    }

    struct StubModel {
        tail: Vec<u32>,
        saw_token_type_ids: Arc<AtomicBool>,
    }

    impl GenerationModel for StubModel {
        fn generate(
            &self,
            inputs: &EncodedInputs,
            _max_new_tokens: usize,
        ) -> Result<GeneratedSequence, OcrError> {
            if inputs.contains(TOKEN_TYPE_IDS) {
                self.saw_token_type_ids.store(true, Ordering::SeqCst);
            }
            let ids = inputs.get(INPUT_IDS).unwrap();
            let mut sequence: Vec<u32> = ids.i(0).unwrap().to_vec1().unwrap();
            sequence.extend_from_slice(&self.tail);
            Ok(GeneratedSequence::new(vec![sequence]))
        }
    }

    struct StubAcquirer {
        prompt: Vec<u32>,
        tail: Vec<u32>,
        with_token_type_ids: bool,
        invoked: Arc<AtomicBool>,
        saw_token_type_ids: Arc<AtomicBool>,
        fail: Option<String>,
    }

    impl StubAcquirer {
        fn new(prompt: Vec<u32>, tail: Vec<u32>) -> Self {
            Self {
                prompt,
                tail,
                with_token_type_ids: false,
                invoked: Arc::new(AtomicBool::new(false)),
                saw_token_type_ids: Arc::new(AtomicBool::new(false)),
                fail: None,
            }
        }
    }

    impl ModelAcquirer for StubAcquirer {
        fn acquire(&self, model_id: &str) -> Result<ModelHandle, OcrError> {
            self.invoked.store(true, Ordering::SeqCst);
            if let Some(message) = &self.fail {
                return Err(OcrError::model_load(model_id, message.clone()));
            }
            let processor = Arc::new(StubProcessor {
                prompt: self.prompt.clone(),
                with_token_type_ids: self.with_token_type_ids,
            });
            let model = Arc::new(StubModel {
                tail: self.tail.clone(),
                saw_token_type_ids: self.saw_token_type_ids.clone(),
            });
            Ok(ModelHandle::new(processor, model, model_id))
        }
    }

    fn config_for(image: Option<&str>) -> RunConfig {
        RunConfig {
            image_path: image.map(PathBuf::from),
            ..RunConfig::default()
        }
    }

    #[test]
    fn run_discovers_decodes_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("invoice.png"), b"not a real png").unwrap();

        let acquirer = StubAcquirer::new(vec![5, 6, 7], vec![40, 41]);
        let outcome = run_with(&config_for(None), &acquirer, dir.path()).unwrap();

        assert_eq!(outcome.text, "<40><41>");
        assert_eq!(outcome.image.path, dir.path().join("invoice.png"));
        assert_eq!(outcome.output, dir.path().join("invoice_ocr.txt"));
        assert_eq!(
            std::fs::read_to_string(&outcome.output).unwrap(),
            "<40><41>"
        );
    }

    #[test]
    fn decoding_skips_the_prompt_tokens() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("scan.jpg"), b"jpeg bytes").unwrap();

        let acquirer = StubAcquirer::new(vec![1, 2, 3, 4], vec![9]);
        let outcome = run_with(&config_for(Some("scan.jpg")), &acquirer, dir.path()).unwrap();

        assert_eq!(outcome.text, "<9>");
        assert!(!outcome.text.contains("<1>"));
    }

    #[test]
    fn token_type_ids_never_reach_the_model() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("page.png"), b"png bytes").unwrap();

        let mut acquirer = StubAcquirer::new(vec![5, 6], vec![7]);
        acquirer.with_token_type_ids = true;
        run_with(&config_for(None), &acquirer, dir.path()).unwrap();

        assert!(!acquirer.saw_token_type_ids.load(Ordering::SeqCst));
    }

    #[test]
    fn unsupported_formats_fail_before_model_load() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("clip.gif"), b"GIF89a").unwrap();

        let acquirer = StubAcquirer::new(vec![1], vec![2]);
        let err = run_with(&config_for(Some("clip.gif")), &acquirer, dir.path()).unwrap_err();

        assert!(matches!(err, OcrError::UnsupportedFormat { .. }));
        assert!(!acquirer.invoked.load(Ordering::SeqCst));
        assert!(!dir.path().join("clip_ocr.txt").exists());
    }

    #[test]
    fn missing_explicit_image_fails_before_model_load() {
        let dir = tempfile::tempdir().unwrap();

        let acquirer = StubAcquirer::new(vec![1], vec![2]);
        let err = run_with(&config_for(Some("ghost.png")), &acquirer, dir.path()).unwrap_err();

        assert!(matches!(err, OcrError::ImageNotFound { .. }));
        assert!(!acquirer.invoked.load(Ordering::SeqCst));
    }

    #[test]
    fn empty_directory_reports_no_image_found() {
        let dir = tempfile::tempdir().unwrap();

        let acquirer = StubAcquirer::new(vec![1], vec![2]);
        let err = run_with(&config_for(None), &acquirer, dir.path()).unwrap_err();

        assert!(matches!(err, OcrError::NoImageFound { .. }));
    }

    #[test]
    fn acquisition_failures_surface_as_model_load() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("page.png"), b"png bytes").unwrap();

        let mut acquirer = StubAcquirer::new(vec![1], vec![2]);
        acquirer.fail = Some("CUDA out of memory".to_string());
        let err = run_with(&config_for(None), &acquirer, dir.path()).unwrap_err();

        assert!(matches!(err, OcrError::ModelLoad { .. }));
        assert!(err.to_string().contains("CUDA out of memory"));
        assert!(!dir.path().join("page_ocr.txt").exists());
    }

    #[test]
    fn empty_generation_batch_is_an_inference_error() {
        struct EmptyModel;
        impl GenerationModel for EmptyModel {
            fn generate(
                &self,
                _inputs: &EncodedInputs,
                _max_new_tokens: usize,
            ) -> Result<GeneratedSequence, OcrError> {
                Ok(GeneratedSequence::new(vec![]))
            }
        }

        let processor = Arc::new(StubProcessor {
            prompt: vec![1, 2],
            with_token_type_ids: false,
        });
        let handle = ModelHandle::new(processor, Arc::new(EmptyModel), "stub");
        let image = ImageReference {
            path: PathBuf::from("page.png"),
        };
        let err = infer(&handle, &image, 8).unwrap_err();
        assert!(matches!(err, OcrError::Inference { .. }));
    }
}
