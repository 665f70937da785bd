use crate::{
    config::{ModelsConfig, SpecialTokens, Validatable, VqaMode},
    model_service::{CaptionModel, ModelError, VqaModel},
};
use async_trait::async_trait;
use image::{imageops::FilterType, RgbImage};
use ndarray::{Array, Array2, ArrayD, Ix4};
use ort::{
    session::{builder::GraphOptimizationLevel, Session, SessionOutputs},
    value::TensorRef,
};
use parking_lot::{Mutex, MutexGuard};
use std::{
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tokenizers::Tokenizer;

const IMAGE_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const IMAGE_STD: [f32; 3] = [0.268_629_54, 0.261_302_6, 0.275_777_1];
const VQA_PROMPT: &str = "Answer the following question based on the image:";

pub fn init_runtime() -> Result<(), ModelError> {
    ort::init()
        .with_name("caption_qa")
        .commit()
        .map_err(|e| ModelError::Load(format!("failed to initialize onnx runtime: {}", e)))?;
    Ok(())
}

/// Resizes to `size`x`size`, scales to [0, 1] and normalizes with the CLIP statistics.
fn transform_image(image: &RgbImage, size: u32) -> Result<Array<f32, Ix4>, ModelError> {
    if image.width() == 0 || image.height() == 0 {
        return Err(ModelError::Preprocess("image has no pixels".to_string()));
    }

    let img = image::imageops::resize(image, size, size, FilterType::CatmullRom);

    let size = size as usize;
    let mut input = Array::zeros((1, 3, size, size));
    for (x, y, pixel) in img.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..3 {
            input[[0, c, y, x]] = ((pixel.0[c] as f32) / 255. - IMAGE_MEAN[c]) / IMAGE_STD[c];
        }
    }

    Ok(input)
}

fn argmax(values: &[f32]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .reduce(|accum, item| if item.1 > accum.1 { item } else { accum })
        .map(|(index, _)| index)
}

/// Greedy pick from the last position of flattened `[1, seq_len, vocab]` logits.
fn next_token(logits: &[f32], shape: &[i64], seq_len: usize) -> Result<i64, ModelError> {
    let vocab_size = match shape {
        [_, _, vocab] => *vocab as usize,
        _ => {
            return Err(ModelError::Inference(format!(
                "expected 3d logits, got {} dimensions",
                shape.len()
            )))
        }
    };
    let last = seq_len
        .checked_sub(1)
        .ok_or_else(|| ModelError::Inference("empty decoder input".to_string()))?;

    logits
        .get(last * vocab_size..(last + 1) * vocab_size)
        .and_then(argmax)
        .map(|index| index as i64)
        .ok_or_else(|| ModelError::Inference("decoder returned no logits".to_string()))
}

/// Generated ids that follow the prompt.
fn strip_prompt<'a>(ids: &'a [i64], prompt_ids: &[i64]) -> &'a [i64] {
    ids.strip_prefix(prompt_ids).unwrap_or(ids)
}

fn vqa_prompt(question: &str) -> String {
    format!("{} {}", VQA_PROMPT, question.trim())
}

fn extract_f32(outputs: &SessionOutputs, name: &str) -> Result<ArrayD<f32>, ModelError> {
    let (shape, data) = outputs[name]
        .try_extract_tensor::<f32>()
        .map_err(|e| ModelError::Inference(format!("failed to extract `{}`: {}", name, e)))?;

    ArrayD::from_shape_vec(shape.to_ixdyn(), data.to_vec())
        .map_err(|e| ModelError::Inference(format!("invalid `{}` shape: {}", name, e)))
}

/// Attention mask covering every position of `[batch, seq, hidden]` encoder states.
fn encoder_mask(states: &ArrayD<f32>) -> Result<Array2<i64>, ModelError> {
    match states.shape() {
        [batch, seq, _] => Ok(Array2::ones((*batch, *seq))),
        other => Err(ModelError::Inference(format!(
            "expected 3d encoder states, got shape {:?}",
            other
        ))),
    }
}

struct SessionPool {
    sessions: Vec<Mutex<Session>>,
    counter: AtomicUsize,
}

impl SessionPool {
    fn load(path: &Path, num_instances: usize, intra_threads: usize) -> Result<Self, ModelError> {
        let sessions = (0..num_instances.max(1))
            .map(|_| {
                let session = Session::builder()?
                    .with_optimization_level(GraphOptimizationLevel::Level3)?
                    .with_intra_threads(intra_threads)?
                    .commit_from_file(path)?;
                Ok(Mutex::new(session))
            })
            .collect::<Result<Vec<_>, ort::Error>>()
            .map_err(|e| ModelError::Load(format!("{}: {}", path.display(), e)))?;

        tracing::info!("Created {} ONNX sessions for {:?}", sessions.len(), path);

        Ok(Self {
            sessions,
            counter: AtomicUsize::new(0),
        })
    }

    fn acquire(&self) -> MutexGuard<'_, Session> {
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % self.sessions.len();
        tracing::trace!("Handling request with session {}", index);
        self.sessions[index].lock()
    }
}

/// ONNX export of a BLIP checkpoint: vision encoder, optional question encoder
/// and a text decoder run greedily, without a key/value cache.
struct BlipRuntime {
    vision: SessionPool,
    text_encoder: Option<SessionPool>,
    decoder: SessionPool,
    tokenizer: Tokenizer,
    tokens: SpecialTokens,
    image_size: u32,
    max_new_tokens: usize,
}

struct BlipFiles<'a> {
    vision: &'a str,
    text_encoder: Option<&'a str>,
    decoder: &'a str,
    tokenizer: &'a str,
    max_new_tokens: usize,
}

impl BlipRuntime {
    fn load(config: &ModelsConfig, files: BlipFiles<'_>) -> Result<Self, ModelError> {
        let dir = &config.model_dir;
        let pool = |file: &str| SessionPool::load(&dir.join(file), config.num_instances, config.intra_threads);

        let tokenizer = Tokenizer::from_file(dir.join(files.tokenizer))
            .map_err(|e| ModelError::Load(format!("failed to initialize tokenizer: {}", e)))?;

        Ok(Self {
            vision: pool(files.vision)?,
            text_encoder: files.text_encoder.map(pool).transpose()?,
            decoder: pool(files.decoder)?,
            tokenizer,
            tokens: config.tokens,
            image_size: config.image_size,
            max_new_tokens: files.max_new_tokens,
        })
    }

    fn tokenize(&self, text: &str, add_special_tokens: bool) -> Result<Vec<i64>, ModelError> {
        let encoding = self
            .tokenizer
            .encode(text, add_special_tokens)
            .map_err(|e| ModelError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().iter().map(|&id| id as i64).collect())
    }

    fn decode(&self, ids: &[i64]) -> Result<String, ModelError> {
        let ids: Vec<u32> = ids.iter().map(|&id| id as u32).collect();
        let text = self
            .tokenizer
            .decode(&ids, true)
            .map_err(|e| ModelError::Tokenizer(e.to_string()))?;
        Ok(text.trim().to_string())
    }

    fn encode_image(&self, image: &RgbImage) -> Result<ArrayD<f32>, ModelError> {
        let pixel_values = transform_image(image, self.image_size)?;

        let mut session = self.vision.acquire();
        let outputs = session.run(ort::inputs![
            "pixel_values" => TensorRef::from_array_view(pixel_values.view())?
        ])?;

        extract_f32(&outputs, "last_hidden_state")
    }

    fn encode_question(
        &self,
        question_ids: &[i64],
        image_embeds: &ArrayD<f32>,
    ) -> Result<ArrayD<f32>, ModelError> {
        let encoder = self.text_encoder.as_ref().ok_or_else(|| {
            ModelError::Inference("no text encoder loaded for question encoding".to_string())
        })?;

        let input_ids = Array2::from_shape_vec((1, question_ids.len()), question_ids.to_vec())
            .map_err(|e| ModelError::Inference(e.to_string()))?;
        let attention_mask = Array2::<i64>::ones((1, question_ids.len()));
        let image_mask = encoder_mask(image_embeds)?;

        let mut session = encoder.acquire();
        let outputs = session.run(ort::inputs![
            "input_ids" => TensorRef::from_array_view(input_ids.view())?,
            "attention_mask" => TensorRef::from_array_view(attention_mask.view())?,
            "encoder_hidden_states" => TensorRef::from_array_view(image_embeds.view())?,
            "encoder_attention_mask" => TensorRef::from_array_view(image_mask.view())?
        ])?;

        extract_f32(&outputs, "last_hidden_state")
    }

    /// Greedy decoding from `[bos] + prefix`. Returns the prefix followed by the
    /// generated tokens, without the start token.
    fn generate(&self, encoder_states: &ArrayD<f32>, prefix: &[i64]) -> Result<Vec<i64>, ModelError> {
        let states_mask = encoder_mask(encoder_states)?;

        let mut ids = Vec::with_capacity(1 + prefix.len() + self.max_new_tokens);
        ids.push(self.tokens.bos_token_id);
        ids.extend_from_slice(prefix);

        for _ in 0..self.max_new_tokens {
            let input_ids = Array2::from_shape_vec((1, ids.len()), ids.clone())
                .map_err(|e| ModelError::Inference(e.to_string()))?;
            let attention_mask = Array2::<i64>::ones((1, ids.len()));

            let mut session = self.decoder.acquire();
            let outputs = session.run(ort::inputs![
                "input_ids" => TensorRef::from_array_view(input_ids.view())?,
                "attention_mask" => TensorRef::from_array_view(attention_mask.view())?,
                "encoder_hidden_states" => TensorRef::from_array_view(encoder_states.view())?,
                "encoder_attention_mask" => TensorRef::from_array_view(states_mask.view())?
            ])?;

            let (shape, logits) = outputs["logits"].try_extract_tensor::<f32>()?;
            let next = next_token(logits, shape, ids.len())?;

            if next == self.tokens.sep_token_id {
                break;
            }
            ids.push(next);
        }

        tracing::debug!("Generated {} tokens", ids.len() - 1 - prefix.len());
        ids.remove(0);
        Ok(ids)
    }
}

#[derive(Clone)]
pub struct OrtCaptionModel {
    runtime: Arc<BlipRuntime>,
    prompt_ids: Vec<i64>,
}

impl OrtCaptionModel {
    pub fn new(config: &ModelsConfig) -> Result<Self, ModelError> {
        let caption = &config.caption;
        caption.validate(&config.model_dir).map_err(ModelError::Load)?;

        let runtime = BlipRuntime::load(
            config,
            BlipFiles {
                vision: &caption.vision_file,
                text_encoder: None,
                decoder: &caption.decoder_file,
                tokenizer: &caption.tokenizer_file,
                max_new_tokens: caption.max_new_tokens,
            },
        )?;
        let prompt_ids = match &caption.prompt {
            Some(prompt) => runtime.tokenize(prompt, false)?,
            None => Vec::new(),
        };

        Ok(Self {
            runtime: Arc::new(runtime),
            prompt_ids,
        })
    }

    fn caption_blocking(&self, image: &RgbImage) -> Result<String, ModelError> {
        let image_embeds = self.runtime.encode_image(image)?;
        // A conditional prompt is the start of the caption, so it stays in the output.
        let ids = self.runtime.generate(&image_embeds, &self.prompt_ids)?;
        self.runtime.decode(&ids)
    }
}

#[async_trait]
impl CaptionModel for OrtCaptionModel {
    async fn caption(&self, image: RgbImage) -> Result<String, ModelError> {
        let model = self.clone();
        tokio::task::spawn_blocking(move || model.caption_blocking(&image))
            .await
            .map_err(|e| ModelError::Aborted(e.to_string()))?
    }
}

#[derive(Clone)]
pub struct OrtVqaModel {
    runtime: Arc<BlipRuntime>,
    mode: VqaMode,
}

impl OrtVqaModel {
    pub fn new(config: &ModelsConfig) -> Result<Self, ModelError> {
        let vqa = &config.vqa;
        vqa.validate(&config.model_dir).map_err(ModelError::Load)?;

        let text_encoder = match vqa.mode {
            VqaMode::Encoder => vqa.text_encoder_file.as_deref(),
            VqaMode::Prompted => None,
        };
        let runtime = BlipRuntime::load(
            config,
            BlipFiles {
                vision: &vqa.vision_file,
                text_encoder,
                decoder: &vqa.decoder_file,
                tokenizer: &vqa.tokenizer_file,
                max_new_tokens: vqa.max_new_tokens,
            },
        )?;

        Ok(Self {
            runtime: Arc::new(runtime),
            mode: vqa.mode,
        })
    }

    fn answer_blocking(&self, image: &RgbImage, question: &str) -> Result<Vec<String>, ModelError> {
        let image_embeds = self.runtime.encode_image(image)?;

        let answer = match self.mode {
            VqaMode::Encoder => {
                let question_ids = self.runtime.tokenize(question, true)?;
                let question_embeds = self.runtime.encode_question(&question_ids, &image_embeds)?;
                let ids = self.runtime.generate(&question_embeds, &[])?;
                self.runtime.decode(&ids)?
            }
            VqaMode::Prompted => {
                let prompt_ids = self.runtime.tokenize(&vqa_prompt(question), false)?;
                let ids = self.runtime.generate(&image_embeds, &prompt_ids)?;
                self.runtime.decode(strip_prompt(&ids, &prompt_ids))?
            }
        };

        if answer.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![answer])
    }
}

#[async_trait]
impl VqaModel for OrtVqaModel {
    async fn answer(&self, image: RgbImage, question: &str) -> Result<Vec<String>, ModelError> {
        let model = self.clone();
        let question = question.to_string();
        tokio::task::spawn_blocking(move || model.answer_blocking(&image, &question))
            .await
            .map_err(|e| ModelError::Aborted(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    #[test]
    fn test_transform_image() {
        let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_pixel(100, 60, Rgb([255, 0, 0]));

        let input = transform_image(&img, 384).unwrap();

        assert_eq!(input.shape(), &[1, 3, 384, 384]);
        let red = (1.0 - IMAGE_MEAN[0]) / IMAGE_STD[0];
        let green = (0.0 - IMAGE_MEAN[1]) / IMAGE_STD[1];
        assert!((input[[0, 0, 10, 10]] - red).abs() < 1e-4);
        assert!((input[[0, 1, 200, 300]] - green).abs() < 1e-4);
    }

    #[test]
    fn test_transform_empty_image() {
        let img = RgbImage::new(0, 0);

        let result = transform_image(&img, 384);

        assert!(matches!(result, Err(ModelError::Preprocess(_))));
    }

    #[test]
    fn test_argmax() {
        assert_eq!(argmax(&[0.1, 2.5, -1.0, 2.4]), Some(1));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn test_next_token_reads_last_position() {
        // Position 0 favours token 2, position 1 favours token 0.
        let logits = [0.0, 0.1, 0.9, 0.7, 0.2, 0.1];

        assert_eq!(next_token(&logits, &[1, 2, 3], 2).unwrap(), 0);
        assert_eq!(next_token(&logits, &[1, 2, 3], 1).unwrap(), 2);
    }

    #[test]
    fn test_next_token_rejects_bad_shapes() {
        let logits = [0.0, 0.1, 0.9];

        assert!(next_token(&logits, &[1, 3], 1).is_err());
        assert!(next_token(&logits, &[1, 1, 3], 2).is_err());
        assert!(next_token(&logits, &[1, 1, 3], 0).is_err());
    }

    #[test]
    fn test_strip_prompt() {
        assert_eq!(strip_prompt(&[7, 8, 9, 42, 43], &[7, 8, 9]), &[42, 43]);
        assert_eq!(strip_prompt(&[7, 8, 9], &[7, 8, 9]), &[] as &[i64]);
        assert_eq!(strip_prompt(&[42, 43], &[]), &[42, 43]);
        assert_eq!(strip_prompt(&[5, 6], &[7, 8, 9]), &[5, 6]);
    }

    #[test]
    fn test_vqa_prompt() {
        assert_eq!(
            vqa_prompt("  What color is the animal? "),
            "Answer the following question based on the image: What color is the animal?"
        );
    }

    #[test]
    fn test_encoder_mask_matches_sequence_length() {
        let states = ArrayD::<f32>::zeros(ndarray::IxDyn(&[1, 577, 8]));

        let mask = encoder_mask(&states).unwrap();

        assert_eq!(mask.shape(), &[1, 577]);
        assert!(mask.iter().all(|&v| v == 1));
        assert!(encoder_mask(&ArrayD::<f32>::zeros(ndarray::IxDyn(&[4, 4]))).is_err());
    }
}
