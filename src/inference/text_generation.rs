use std::fs::File;
use std::time::Instant;

use candle_core::safetensors::MmapedSafetensors;
use candle_core::Device;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::config::{LlamaConfig, TextGenerationConfig};
use crate::error::{InferenceError, Result};
use crate::hub::ModelSource;
use crate::inference::{default_dtype, TextGenerator};
use crate::llm::inference::{generate, Sampling};
use crate::llm::models::LlamaModel;

/// Text generation with a Llama-family checkpoint, loaded once and shared
/// read-only by every request.
pub struct LlamaTextGenerator {
    model: LlamaModel,
    tokenizer: Tokenizer,
    device: Device,
    sampling: Sampling,
    eos_token_id: u32,
    max_positions: usize,
}

impl LlamaTextGenerator {
    pub fn new(model: LlamaModel, tokenizer: Tokenizer, device: Device, sampling: Sampling) -> Self {
        let eos_token_id = model.cfg.eos_token_id;
        let max_positions = model.cfg.max_position_embeddings;
        Self {
            model,
            tokenizer,
            device,
            sampling,
            eos_token_id,
            max_positions,
        }
    }

    pub fn load(config: &TextGenerationConfig, device: &Device) -> Result<Self> {
        info!("Loading text generation model {}", config.model);
        let start = Instant::now();

        let source = ModelSource::new(&config.model)?;
        let weights_path = source.get("model.safetensors")?;
        let tokenizer_path = source.get("tokenizer.json")?;
        let config_path = source.get("config.json")?;

        let cfg: LlamaConfig = serde_json::from_reader(File::open(&config_path)?)?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(InferenceError::tokenizer)?;
        let weights = unsafe { MmapedSafetensors::new(&weights_path)? };
        let model = LlamaModel::new(&weights, &cfg, device, default_dtype(device))?;

        info!(
            "Text generation model ready: {} layers in {:.1}s",
            cfg.num_hidden_layers,
            start.elapsed().as_secs_f64()
        );

        let sampling = Sampling {
            temperature: config.temperature,
            seed: config.seed,
        };
        Ok(Self::new(model, tokenizer, device.clone(), sampling))
    }
}

impl TextGenerator for LlamaTextGenerator {
    fn generate(&self, input_text: &str, max_length: i64) -> Result<String> {
        if max_length <= 0 {
            return Err(InferenceError::InvalidInput(format!(
                "max_length must be positive, got {}",
                max_length
            )));
        }

        let encoding = self
            .tokenizer
            .encode(input_text, true)
            .map_err(InferenceError::tokenizer)?;
        let prompt_ids = encoding.get_ids();

        let max_new_tokens = usize::try_from(max_length)
            .unwrap_or(usize::MAX)
            .min(self.max_positions)
            .saturating_sub(prompt_ids.len());

        let start = Instant::now();
        let output_ids = generate(
            prompt_ids,
            max_new_tokens,
            &self.model,
            &self.device,
            &self.sampling,
            self.eos_token_id,
        )?;
        debug!(
            "Generated {} tokens after a {} token prompt in {:.0}ms",
            output_ids.len() - prompt_ids.len(),
            prompt_ids.len(),
            start.elapsed().as_secs_f64() * 1000.0
        );

        self.tokenizer
            .decode(&output_ids, true)
            .map_err(InferenceError::tokenizer)
    }
}
