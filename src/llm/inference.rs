use candle_core::{DType, Device, IndexOp, Result as CandleResult, Tensor};
use candle_nn::ops::softmax;
use rand::distr::{weighted::WeightedIndex, Distribution};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::llm::causal_self_attention::KVCache;
use crate::llm::models::Model;

/// How the next token is picked from the logits.
#[derive(Debug, Clone, Copy)]
pub struct Sampling {
    /// `None` picks the most likely token.
    pub temperature: Option<f64>,
    pub seed: u64,
}

impl Default for Sampling {
    fn default() -> Self {
        Self {
            temperature: None,
            seed: 42,
        }
    }
}

struct Sampler {
    temperature: Option<f64>,
    rng: StdRng,
}

impl Sampler {
    fn new(sampling: &Sampling) -> Self {
        Self {
            // clamp to a reasonable range
            temperature: sampling.temperature.map(|t| t.clamp(0.01, 100.0)),
            rng: StdRng::seed_from_u64(sampling.seed),
        }
    }

    fn sample(&mut self, logits: &Tensor) -> CandleResult<u32> {
        let logits = logits.to_dtype(DType::F32)?;
        match self.temperature {
            None => logits.argmax(0)?.to_scalar::<u32>(),
            Some(temperature) => {
                let probs = softmax(&(logits / temperature)?, 0)?.to_vec1::<f32>()?;
                let dist = WeightedIndex::new(&probs)
                    .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
                Ok(dist.sample(&mut self.rng) as u32)
            }
        }
    }
}

/// Extends `prompt_ids` by at most `max_new_tokens` tokens, stopping before
/// `eos_token_id`. Returns the prompt followed by the generated tokens.
pub fn generate(
    prompt_ids: &[u32],
    max_new_tokens: usize,
    model: &dyn Model,
    device: &Device,
    sampling: &Sampling,
    eos_token_id: u32,
) -> CandleResult<Vec<u32>> {
    let mut token_ids = prompt_ids.to_vec();
    if max_new_tokens == 0 || token_ids.is_empty() {
        return Ok(token_ids);
    }

    let mut sampler = Sampler::new(sampling);
    let mut kv_caches = vec![KVCache::new(); model.num_layers()];

    // the whole prompt goes through in the first pass, one token per pass after that
    let mut input = Tensor::new(token_ids.as_slice(), device)?.unsqueeze(0)?;
    let mut position = 0;

    for _ in 0..max_new_tokens {
        let output = model.forward_with_cache(&input, &mut kv_caches, position)?;
        let next_token_logits = output.i((0, output.dim(1)? - 1))?;
        let next_token = sampler.sample(&next_token_logits)?;

        if next_token == eos_token_id {
            break;
        }

        position = token_ids.len();
        token_ids.push(next_token);
        input = Tensor::new(&[next_token], device)?.unsqueeze(0)?;
    }

    Ok(token_ids)
}
