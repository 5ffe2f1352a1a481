//! The candle-backed engine: artifact loading, chat encoding, embedding
//! splicing and greedy autoregressive generation.

use super::config::{GlmConfig, GlmImageProcessorConfig};
use super::processing::prepare_image;
use super::text::GlmTextModel;
use super::vision::GlmVisionModel;
use crate::backend::{
    ChatProcessor, EncodedInputs, GeneratedSequence, GenerationModel, IMAGE_GRID_THW, INPUT_IDS,
    PIXEL_VALUES, TOKEN_TYPE_IDS,
};
use crate::chat::{ChatMessage, ContentPart};
use crate::error::{BoxedError, OcrError};
use candle_core::{D, DType, Device, IndexOp, Tensor};
use candle_nn::{Linear, Module, VarBuilder, linear_no_bias};
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;

/// Placeholder the chat template reserves per merged image patch.
const IMAGE_TOKEN: &str = "<|image|>";

/// The files a model checkout must provide.
#[derive(Debug, Clone)]
pub struct GlmArtifacts {
    pub config: PathBuf,
    pub preprocessor: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: PathBuf,
}

impl GlmArtifacts {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            config: dir.join("config.json"),
            preprocessor: dir.join("preprocessor_config.json"),
            tokenizer: dir.join("tokenizer.json"),
            weights: dir.join("model.safetensors"),
        }
    }
}

pub struct GlmOcrEngine {
    device: Device,
    dtype: DType,
    cfg: GlmConfig,
    image_cfg: GlmImageProcessorConfig,
    tokenizer: Tokenizer,
    text: GlmTextModel,
    vision: GlmVisionModel,
    lm_head: Linear,
    eos_token_ids: Vec<u32>,
}

impl GlmOcrEngine {
    pub fn load(artifacts: &GlmArtifacts, device: Device) -> Result<Self, BoxedError> {
        let cfg = GlmConfig::from_path(&artifacts.config)?;
        let image_cfg = GlmImageProcessorConfig::from_path(&artifacts.preprocessor)?;
        image_cfg.validate(&cfg.vision_config)?;

        let tokenizer = Tokenizer::from_file(&artifacts.tokenizer)?;
        if let Some(token_id) = tokenizer.token_to_id(IMAGE_TOKEN)
            && token_id != cfg.image_token_id
        {
            return Err(format!(
                "tokenizer maps {IMAGE_TOKEN} to {token_id} but the model config says {}",
                cfg.image_token_id
            )
            .into());
        }

        let dtype = device.bf16_default_to_f32();
        // SAFETY: the weight file is mapped read-only and must not be
        // modified or removed while the model is alive.
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[artifacts.weights.clone()], dtype, &device)?
        };

        let text = GlmTextModel::load(&cfg.text_config, vb.pp("model").pp("language_model"))?;
        let vision = GlmVisionModel::load(&cfg.vision_config, vb.pp("model").pp("visual"))?;
        let lm_head = if cfg.tie_word_embeddings || cfg.text_config.tie_word_embeddings {
            Linear::new(text.token_embedding_weight(), None)
        } else {
            linear_no_bias(
                cfg.text_config.hidden_size,
                cfg.text_config.vocab_size,
                vb.pp("lm_head"),
            )?
        };
        let eos_token_ids = cfg.text_config.eos_token_id.to_vec();

        Ok(Self {
            device,
            dtype,
            cfg,
            image_cfg,
            tokenizer,
            text,
            vision,
            lm_head,
            eos_token_ids,
        })
    }

    fn encode_chat_inner(&self, messages: &[ChatMessage]) -> Result<EncodedInputs, BoxedError> {
        let (image_path, instruction) = collect_parts(messages)?;
        let image = image::open(image_path)
            .map_err(|e| format!("failed to open {}: {e}", image_path.display()))?
            .to_rgb8();

        let prepared = prepare_image(
            &image,
            &self.image_cfg,
            &self.cfg.vision_config,
            &self.device,
            self.dtype,
        )?;
        if prepared.image_token_count == 0 {
            return Err("image preprocessing produced zero tokens".into());
        }

        let prompt = render_prompt(prepared.image_token_count, &instruction);
        let encoding = self.tokenizer.encode(prompt, false)?;
        let input_ids = encoding.get_ids().to_vec();
        if input_ids.is_empty() {
            return Err("prompt tokenized to an empty sequence".into());
        }

        let seq_len = input_ids.len();
        let (grid_t, grid_h, grid_w) = prepared.grid_thw;
        let mut inputs = EncodedInputs::new();
        inputs.insert(
            INPUT_IDS,
            Tensor::from_vec(input_ids, (1, seq_len), &self.device)?,
        );
        inputs.insert(
            TOKEN_TYPE_IDS,
            Tensor::zeros((1, seq_len), DType::U32, &self.device)?,
        );
        inputs.insert(
            IMAGE_GRID_THW,
            Tensor::from_vec(
                vec![grid_t as u32, grid_h as u32, grid_w as u32],
                (1, 3),
                &self.device,
            )?,
        );
        inputs.insert(PIXEL_VALUES, prepared.pixel_values);
        Ok(inputs)
    }

    /// Token embeddings for the prompt with the image placeholder run
    /// replaced by vision-tower output.
    fn splice_image_embeddings(
        &self,
        input_ids: &[u32],
        pixel_values: &Tensor,
        grid_thw: (usize, usize, usize),
    ) -> Result<Tensor, BoxedError> {
        let seq_len = input_ids.len();
        let token_ids = Tensor::from_vec(input_ids.to_vec(), (1, seq_len), &self.device)?;
        let embeds = self.text.embed(&token_ids)?;
        let image_embeds = self
            .vision
            .forward(pixel_values, grid_thw)?
            .to_dtype(self.dtype)?;

        let image_token_id = self.cfg.image_token_id;
        let indices: Vec<usize> = input_ids
            .iter()
            .enumerate()
            .filter_map(|(i, &id)| (id == image_token_id).then_some(i))
            .collect();
        let (Some(&start), Some(&end)) = (indices.first(), indices.last()) else {
            return Err("prompt carries no image placeholder tokens".into());
        };
        if end + 1 - start != indices.len() {
            return Err("image placeholder tokens are not contiguous".into());
        }
        let produced = image_embeds.dim(0)?;
        if indices.len() != produced {
            return Err(format!(
                "prompt reserves {} image tokens but the vision tower produced {produced}",
                indices.len()
            )
            .into());
        }

        let hidden = embeds.dim(2)?;
        let prefix = if start > 0 {
            embeds.narrow(1, 0, start)?
        } else {
            Tensor::zeros((1, 0, hidden), embeds.dtype(), embeds.device())?
        };
        let suffix = if end + 1 < seq_len {
            embeds.narrow(1, end + 1, seq_len - end - 1)?
        } else {
            Tensor::zeros((1, 0, hidden), embeds.dtype(), embeds.device())?
        };
        Ok(Tensor::cat(&[&prefix, &image_embeds.unsqueeze(0)?, &suffix], 1)?)
    }

    fn next_token_logits(&self, hidden: &Tensor, index: usize) -> candle_core::Result<Tensor> {
        let last = hidden.i((0, index, ..))?.unsqueeze(0)?;
        self.lm_head.forward(&last)?.squeeze(0)
    }

    fn generate_inner(
        &self,
        inputs: &EncodedInputs,
        max_new_tokens: usize,
    ) -> Result<GeneratedSequence, BoxedError> {
        let input_ids = inputs
            .get(INPUT_IDS)
            .ok_or("inputs are missing input_ids")?;
        let pixel_values = inputs
            .get(PIXEL_VALUES)
            .ok_or("inputs are missing pixel_values")?;
        let grid = inputs
            .get(IMAGE_GRID_THW)
            .ok_or("inputs are missing image_grid_thw")?;

        let input_ids: Vec<u32> = input_ids.i(0)?.to_vec1()?;
        let grid: Vec<u32> = grid.i(0)?.to_vec1()?;
        let [grid_t, grid_h, grid_w] = grid.as_slice() else {
            return Err("image_grid_thw must hold three entries".into());
        };
        let grid_thw = (*grid_t as usize, *grid_h as usize, *grid_w as usize);

        let seq_len = input_ids.len();
        let inputs_embeds = self.splice_image_embeddings(&input_ids, pixel_values, grid_thw)?;
        let (positions, max_pos) = multimodal_position_ids(
            &input_ids,
            grid_thw,
            self.cfg.vision_config.spatial_merge_size,
            self.cfg.image_token_id,
        )?;
        let position_ids = Tensor::from_vec(positions, (3, 1, seq_len), &self.device)?;
        // Decode positions continue from the highest multimodal position, not
        // from the raw sequence index.
        let rope_delta = max_pos + 1 - seq_len as i64;

        self.text.reset_cache();
        let hidden = self.text.forward(&inputs_embeds, &position_ids, None)?;
        let mut logits = self.next_token_logits(&hidden, seq_len - 1)?;

        let mut sequence = input_ids;
        let mut pos = seq_len as i64;
        for _ in 0..max_new_tokens {
            let token = logits.argmax(D::Minus1)?.to_scalar::<u32>()?;
            sequence.push(token);
            if self.eos_token_ids.contains(&token) {
                break;
            }

            let step = Tensor::from_vec(vec![token], (1, 1), &self.device)?;
            let embed = self.text.embed(&step)?;
            let pos_val = pos + rope_delta;
            let step_positions = Tensor::from_vec(vec![pos_val; 3], (3, 1, 1), &self.device)?;
            let hidden = self.text.forward(&embed, &step_positions, None)?;
            logits = self.next_token_logits(&hidden, 0)?;
            pos += 1;
        }

        Ok(GeneratedSequence::new(vec![sequence]))
    }
}

impl ChatProcessor for GlmOcrEngine {
    fn encode_chat(&self, messages: &[ChatMessage]) -> Result<EncodedInputs, OcrError> {
        self.encode_chat_inner(messages).map_err(OcrError::inference)
    }

    fn decode(&self, tokens: &[u32], skip_special_tokens: bool) -> Result<String, OcrError> {
        self.tokenizer
            .decode(tokens, skip_special_tokens)
            .map_err(OcrError::inference)
    }
}

impl GenerationModel for GlmOcrEngine {
    fn generate(
        &self,
        inputs: &EncodedInputs,
        max_new_tokens: usize,
    ) -> Result<GeneratedSequence, OcrError> {
        self.generate_inner(inputs, max_new_tokens)
            .map_err(OcrError::inference)
    }
}

/// Renders the chat template around an instruction, reserving one image
/// placeholder per merged patch.
fn render_prompt(image_token_count: usize, instruction: &str) -> String {
    let image_tokens = IMAGE_TOKEN.repeat(image_token_count);
    format!(
        "[gMASK]<sop><|user|>\n<|begin_of_image|>{image_tokens}<|end_of_image|>{instruction}<|assistant|>\n"
    )
}

/// Extracts the single image path and the concatenated instruction text from
/// a one-message chat request.
fn collect_parts(messages: &[ChatMessage]) -> Result<(&Path, String), BoxedError> {
    let [message] = messages else {
        return Err(format!("expected exactly one chat message, got {}", messages.len()).into());
    };
    let mut image: Option<&Path> = None;
    let mut instruction = String::new();
    for part in &message.parts {
        match part {
            ContentPart::Image { path } => {
                if image.is_some() {
                    return Err("only one image per request is supported".into());
                }
                image = Some(path);
            }
            ContentPart::Text { text } => instruction.push_str(text),
        }
    }
    let image = image.ok_or("chat message carries no image part")?;
    Ok((image, instruction))
}

/// Positions along the temporal, height and width axes for a prompt holding
/// at most one contiguous run of image tokens.
///
/// Text tokens advance all three axes in lockstep; an image run spreads its
/// tokens over the merged grid starting one past the highest position so far.
/// Returns the `(3, seq)` data flattened axis by axis and the largest
/// position used.
fn multimodal_position_ids(
    input_ids: &[u32],
    grid_thw: (usize, usize, usize),
    merge_size: usize,
    image_token_id: u32,
) -> Result<(Vec<i64>, i64), BoxedError> {
    let mut current = match input_ids.first() {
        Some(&id) => id == image_token_id,
        None => return Err("cannot build positions for an empty sequence".into()),
    };
    let mut groups: Vec<(bool, usize, usize)> = Vec::new();
    let mut start = 0usize;
    for (i, &id) in input_ids.iter().enumerate().skip(1) {
        let is_image = id == image_token_id;
        if is_image != current {
            groups.push((current, start, i));
            start = i;
            current = is_image;
        }
    }
    groups.push((current, start, input_ids.len()));

    let (grid_t, grid_h, grid_w) = grid_thw;
    let (llm_t, llm_h, llm_w) = (grid_t, grid_h / merge_size, grid_w / merge_size);
    let expected = llm_t * llm_h * llm_w;

    let seq_len = input_ids.len();
    let mut pos_t = Vec::with_capacity(seq_len);
    let mut pos_h = Vec::with_capacity(seq_len);
    let mut pos_w = Vec::with_capacity(seq_len);
    let mut max_pos: i64 = -1;
    let mut seen_image = false;

    for (is_image, s, e) in groups {
        let st_idx = max_pos + 1;
        if is_image {
            if seen_image {
                return Err("multiple image runs in one prompt are not supported".into());
            }
            seen_image = true;
            if e - s != expected {
                return Err(
                    format!("image run holds {} tokens, expected {expected}", e - s).into(),
                );
            }
            for t in 0..llm_t {
                for h in 0..llm_h {
                    for w in 0..llm_w {
                        pos_t.push(t as i64 + st_idx);
                        pos_h.push(h as i64 + st_idx);
                        pos_w.push(w as i64 + st_idx);
                    }
                }
            }
            max_pos = llm_t.max(llm_h).max(llm_w) as i64 - 1 + st_idx;
        } else {
            for i in 0..e - s {
                let v = i as i64 + st_idx;
                pos_t.push(v);
                pos_h.push(v);
                pos_w.push(v);
            }
            max_pos = st_idx + (e - s) as i64 - 1;
        }
    }

    let mut data = Vec::with_capacity(3 * seq_len);
    data.extend(pos_t);
    data.extend(pos_h);
    data.extend(pos_w);
    Ok((data, max_pos))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{ChatMessage, ContentPart};

    #[test]
    fn prompt_reserves_one_token_per_merged_patch() {
        let prompt = render_prompt(2, "Text Recognition:");
        assert_eq!(
            prompt,
            "[gMASK]<sop><|user|>\n<|begin_of_image|><|image|><|image|><|end_of_image|>Text Recognition:<|assistant|>\n"
        );
    }

    #[test]
    fn collect_parts_requires_exactly_one_image() {
        let no_image = ChatMessage {
            parts: vec![ContentPart::Text {
                text: "read this".into(),
            }],
        };
        assert!(collect_parts(&[no_image]).is_err());

        let two_images = ChatMessage {
            parts: vec![
                ContentPart::Image {
                    path: "a.png".into(),
                },
                ContentPart::Image {
                    path: "b.png".into(),
                },
            ],
        };
        assert!(collect_parts(&[two_images]).is_err());

        assert!(collect_parts(&[]).is_err());
    }

    #[test]
    fn collect_parts_concatenates_text_around_the_image() {
        let message = ChatMessage {
            parts: vec![
                ContentPart::Image {
                    path: "scan.png".into(),
                },
                ContentPart::Text {
                    text: "Text ".into(),
                },
                ContentPart::Text {
                    text: "Recognition:".into(),
                },
            ],
        };
        let messages = [message];
        let (path, instruction) = collect_parts(&messages).unwrap();
        assert_eq!(path, Path::new("scan.png"));
        assert_eq!(instruction, "Text Recognition:");
    }

    #[test]
    fn image_runs_spread_over_the_merged_grid() {
        // Two text tokens, a 2x2 merged image run, one trailing text token.
        let ids = [1, 2, 9, 9, 9, 9, 3];
        let (data, max_pos) = multimodal_position_ids(&ids, (1, 4, 4), 2, 9).unwrap();
        let (t, rest) = data.split_at(7);
        let (h, w) = rest.split_at(7);
        assert_eq!(t, [0, 1, 2, 2, 2, 2, 4]);
        assert_eq!(h, [0, 1, 2, 2, 3, 3, 4]);
        assert_eq!(w, [0, 1, 2, 3, 2, 3, 4]);
        assert_eq!(max_pos, 4);
    }

    #[test]
    fn text_only_positions_are_sequential() {
        let (data, max_pos) = multimodal_position_ids(&[5, 6, 7], (1, 4, 4), 2, 9).unwrap();
        assert_eq!(data, vec![0, 1, 2, 0, 1, 2, 0, 1, 2]);
        assert_eq!(max_pos, 2);
    }

    #[test]
    fn position_building_rejects_malformed_runs() {
        // Wrong run length for the grid.
        assert!(multimodal_position_ids(&[9, 9, 9], (1, 4, 4), 2, 9).is_err());
        // Two separate runs.
        assert!(multimodal_position_ids(&[9, 1, 9], (1, 1, 1), 1, 9).is_err());
        // Nothing at all.
        assert!(multimodal_position_ids(&[], (1, 4, 4), 2, 9).is_err());
    }
}
