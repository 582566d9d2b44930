use std::path::PathBuf;
use std::time::Instant;

use candle_core::{DType, Device, Tensor, D};
use candle_nn::VarBuilder;
use candle_transformers::models::blip;
use image::imageops::FilterType;
use tokenizers::Tokenizer;
use tracing::{debug, warn};

use crate::config::ImageCaptioningConfig;
use crate::error::{InferenceError, Result};
use crate::hub::ModelSource;
use crate::inference::ImageCaptioner;

const IMAGE_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const IMAGE_STD: [f32; 3] = [0.268_629_54, 0.261_302_6, 0.275_777_1];

// BERT vocabulary ids used by the BLIP text decoder
const DEFAULT_BOS_TOKEN_ID: u32 = 30522;
const DEFAULT_SEP_TOKEN_ID: u32 = 102;

/// Image captioning with a BLIP checkpoint read from a local directory.
///
/// The model, tokenizer and config are loaded from disk on every call and
/// dropped afterwards; nothing is kept between requests.
pub struct BlipImageCaptioner {
    model_dir: PathBuf,
    device: Device,
    max_length: usize,
}

struct LoadedCaptioner {
    model: blip::BlipForConditionalGeneration,
    tokenizer: Tokenizer,
    image_size: usize,
    bos_token_id: u32,
    sep_token_id: u32,
}

impl LoadedCaptioner {
    fn new(config: &blip::Config, vb: VarBuilder, tokenizer: Tokenizer) -> Result<Self> {
        let bos_token_id = tokenizer
            .token_to_id("[DEC]")
            .unwrap_or(DEFAULT_BOS_TOKEN_ID);
        let sep_token_id = tokenizer
            .token_to_id("[SEP]")
            .unwrap_or(DEFAULT_SEP_TOKEN_ID);
        let model = blip::BlipForConditionalGeneration::new(config, vb)?;

        Ok(Self {
            model,
            tokenizer,
            image_size: config.vision_config.image_size,
            bos_token_id,
            sep_token_id,
        })
    }
}

impl BlipImageCaptioner {
    pub fn new(config: &ImageCaptioningConfig, device: &Device) -> Self {
        Self {
            model_dir: config.model_dir.clone(),
            device: device.clone(),
            max_length: config.max_length,
        }
    }

    fn load(&self) -> Result<LoadedCaptioner> {
        let source = ModelSource::Local(self.model_dir.clone());
        let weights_path = source.get("model.safetensors")?;
        let tokenizer_path = source.get("tokenizer.json")?;

        let config = match source.get("config.json") {
            Ok(path) => match serde_json::from_str::<blip::Config>(&std::fs::read_to_string(path)?) {
                Ok(config) => config,
                Err(e) => {
                    warn!("Unreadable captioning config.json ({}), using BLIP large", e);
                    blip::Config::image_captioning_large()
                }
            },
            Err(_) => blip::Config::image_captioning_large(),
        };

        let tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(InferenceError::tokenizer)?;
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_path], DType::F32, &self.device)?
        };
        LoadedCaptioner::new(&config, vb, tokenizer)
    }

    fn describe(&self, loaded: &mut LoadedCaptioner, image: &[u8]) -> Result<String> {
        let pixel_values = preprocess(image, loaded.image_size)?.to_device(&self.device)?;
        let token_ids = self.generate_ids(loaded, &pixel_values)?;
        debug!("Caption of {} tokens", token_ids.len());

        // drop the start token, the tokenizer strips [SEP]
        loaded
            .tokenizer
            .decode(&token_ids[1..], true)
            .map(|caption| caption.trim().to_string())
            .map_err(InferenceError::tokenizer)
    }

    fn generate_ids(&self, loaded: &mut LoadedCaptioner, pixel_values: &Tensor) -> Result<Vec<u32>> {
        let image_embeds = pixel_values
            .unsqueeze(0)?
            .apply(loaded.model.vision_model())?;

        let mut token_ids = vec![loaded.bos_token_id];
        while token_ids.len() < self.max_length {
            // earlier positions live in the decoder cache
            let context = if token_ids.len() == 1 {
                &token_ids[..]
            } else {
                &token_ids[token_ids.len() - 1..]
            };
            let input_ids = Tensor::new(context, &self.device)?.unsqueeze(0)?;
            let logits = loaded
                .model
                .text_decoder()
                .forward(&input_ids, &image_embeds)?
                .squeeze(0)?;
            let logits = logits.get(logits.dim(0)? - 1)?;
            let next_token = logits.argmax(D::Minus1)?.to_scalar::<u32>()?;

            token_ids.push(next_token);
            if next_token == loaded.sep_token_id {
                break;
            }
        }
        Ok(token_ids)
    }
}

impl ImageCaptioner for BlipImageCaptioner {
    fn caption(&self, image: &[u8]) -> Result<String> {
        let start = Instant::now();
        let mut loaded = self.load()?;
        let load_ms = start.elapsed().as_secs_f64() * 1000.0;

        let caption = self.describe(&mut loaded, image)?;
        debug!(
            "Captioned in {:.0}ms ({:.0}ms load)",
            start.elapsed().as_secs_f64() * 1000.0,
            load_ms
        );
        Ok(caption)
    }
}

/// Decodes an encoded image into a normalized `(3, size, size)` f32 tensor.
pub fn preprocess(image: &[u8], size: usize) -> Result<Tensor> {
    let img = image::load_from_memory(image)?
        .resize_exact(size as u32, size as u32, FilterType::CatmullRom)
        .to_rgb8();

    let data = Tensor::from_vec(img.into_raw(), (size, size, 3), &Device::Cpu)?.permute((2, 0, 1))?;
    let mean = Tensor::new(&IMAGE_MEAN, &Device::Cpu)?.reshape((3, 1, 1))?;
    let std = Tensor::new(&IMAGE_STD, &Device::Cpu)?.reshape((3, 1, 1))?;

    let pixels = (data.to_dtype(DType::F32)? / 255.)?
        .broadcast_sub(&mean)?
        .broadcast_div(&std)?;
    Ok(pixels)
}
