use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

use candle_core::{DType, Device, Tensor, D};
use candle_nn::VarBuilder;
use candle_transformers::models::t5;
use tokenizers::models::bpe::BPE;
use tokenizers::pre_tokenizers::byte_level::ByteLevel;
use tokenizers::processors::roberta::RobertaProcessing;
use tokenizers::{AddedToken, Tokenizer};
use tracing::{debug, info};

use crate::config::CodeSummarizationConfig;
use crate::error::{InferenceError, Result};
use crate::hub::ModelSource;
use crate::inference::CodeSummarizer;

/// Code-to-docstring summarization with a T5 encoder-decoder (CodeT5).
///
/// The candle model keeps its decoder KV cache inside, so generations run
/// one at a time behind a mutex and the cache is cleared after each.
pub struct T5CodeSummarizer {
    model: Mutex<t5::T5ForConditionalGeneration>,
    tokenizer: Tokenizer,
    config: t5::Config,
    device: Device,
    max_length: usize,
}

impl T5CodeSummarizer {
    pub fn new(
        model: t5::T5ForConditionalGeneration,
        tokenizer: Tokenizer,
        config: t5::Config,
        device: Device,
        max_length: usize,
    ) -> Self {
        Self {
            model: Mutex::new(model),
            tokenizer,
            config,
            device,
            max_length,
        }
    }

    pub fn load(config: &CodeSummarizationConfig, device: &Device) -> Result<Self> {
        info!("Loading code summarization model {}", config.model);
        let start = Instant::now();

        let source = ModelSource::new(&config.model)?;
        let config_path = source.get("config.json")?;
        let weights_path = source.get(&config.weights_file)?;

        let t5_config: t5::Config = serde_json::from_str(&std::fs::read_to_string(config_path)?)?;
        let tokenizer = load_tokenizer(&source)?;
        let vb = var_builder(&weights_path, device)?;
        let model = t5::T5ForConditionalGeneration::load(vb, &t5_config)?;

        info!(
            "Code summarization model ready in {:.1}s",
            start.elapsed().as_secs_f64()
        );
        Ok(Self::new(
            model,
            tokenizer,
            t5_config,
            device.clone(),
            config.max_length,
        ))
    }

    /// Greedy decoding until EOS or `max_length` decoder tokens, the
    /// decoder start token included.
    fn generate_ids(&self, input_ids: &[u32]) -> Result<Vec<u32>> {
        let mut model = self
            .model
            .lock()
            .map_err(|_| InferenceError::Task("code summarization model lock poisoned".into()))?;

        let result = self.decode_greedy(&mut model, input_ids);
        model.clear_kv_cache();
        result
    }

    fn decode_greedy(
        &self,
        model: &mut t5::T5ForConditionalGeneration,
        input_ids: &[u32],
    ) -> Result<Vec<u32>> {
        let input = Tensor::new(input_ids, &self.device)?.unsqueeze(0)?;
        let encoder_output = model.encode(&input)?;

        let start_token = self
            .config
            .decoder_start_token_id
            .unwrap_or(self.config.pad_token_id) as u32;
        let mut output_ids = vec![start_token];

        while output_ids.len() < self.max_length {
            // with a warm cache only the newest token is fed
            let decoder_input = if output_ids.len() == 1 || !self.config.use_cache {
                Tensor::new(output_ids.as_slice(), &self.device)?.unsqueeze(0)?
            } else {
                Tensor::new(&output_ids[output_ids.len() - 1..], &self.device)?.unsqueeze(0)?
            };
            let logits = model.decode(&decoder_input, &encoder_output)?.squeeze(0)?;
            let next_token = logits.argmax(D::Minus1)?.to_scalar::<u32>()?;

            output_ids.push(next_token);
            if next_token as usize == self.config.eos_token_id {
                break;
            }
        }

        Ok(output_ids)
    }
}

/// Prefers `tokenizer.json`. CodeT5 checkpoints usually ship only the
/// byte-level BPE files (`vocab.json`, `merges.txt`), so those are the
/// fallback.
fn load_tokenizer(source: &ModelSource) -> Result<Tokenizer> {
    match source.get("tokenizer.json") {
        Ok(path) => Tokenizer::from_file(&path).map_err(InferenceError::tokenizer),
        Err(e) => {
            debug!("No tokenizer.json ({}), building from vocab.json and merges.txt", e);
            let vocab_path = source.get("vocab.json")?;
            let merges_path = source.get("merges.txt")?;
            roberta_tokenizer(&vocab_path, &merges_path)
        }
    }
}

/// RoBERTa-style byte-level BPE: `<s> ... </s>` around every encoding.
fn roberta_tokenizer(vocab_path: &Path, merges_path: &Path) -> Result<Tokenizer> {
    let bpe = BPE::from_file(&vocab_path.to_string_lossy(), &merges_path.to_string_lossy())
        .build()
        .map_err(InferenceError::tokenizer)?;

    let mut tokenizer = Tokenizer::new(bpe);
    tokenizer.with_pre_tokenizer(Some(ByteLevel::new(false, true, true)));
    tokenizer.with_decoder(Some(ByteLevel::default()));
    tokenizer.add_special_tokens(&[
        AddedToken::from("<s>", true),
        AddedToken::from("</s>", true),
        AddedToken::from("<pad>", true),
        AddedToken::from("<unk>", true),
    ]);

    let special_id = |token: &str| {
        tokenizer
            .token_to_id(token)
            .ok_or_else(|| InferenceError::Tokenizer(format!("{} missing from vocab.json", token)))
    };
    let cls = special_id("<s>")?;
    let sep = special_id("</s>")?;
    tokenizer.with_post_processor(Some(
        RobertaProcessing::new(("</s>".to_string(), sep), ("<s>".to_string(), cls))
            .add_prefix_space(false),
    ));
    Ok(tokenizer)
}

fn var_builder(weights_path: &Path, device: &Device) -> Result<VarBuilder<'static>> {
    let is_safetensors = weights_path
        .extension()
        .is_some_and(|ext| ext == "safetensors");
    let vb = if is_safetensors {
        unsafe { VarBuilder::from_mmaped_safetensors(&[weights_path], DType::F32, device)? }
    } else {
        VarBuilder::from_pth(weights_path, DType::F32, device)?
    };
    Ok(vb)
}

impl CodeSummarizer for T5CodeSummarizer {
    fn summarize(&self, code_block: &str) -> Result<String> {
        let encoding = self
            .tokenizer
            .encode(code_block, true)
            .map_err(InferenceError::tokenizer)?;

        let start = Instant::now();
        let output_ids = self.generate_ids(encoding.get_ids())?;
        debug!(
            "Summarized {} input tokens into {} tokens in {:.0}ms",
            encoding.len(),
            output_ids.len(),
            start.elapsed().as_secs_f64() * 1000.0
        );

        self.tokenizer
            .decode(&output_ids, true)
            .map_err(InferenceError::tokenizer)
    }
}
