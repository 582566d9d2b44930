use candle_core::safetensors::MmapedSafetensors;
use candle_core::{DType, Device, Result as CandleResult, Tensor};

use crate::config::LlamaConfig;
use crate::layers::embedding::EmbeddingLayer;
use crate::layers::layer::Layer;
use crate::layers::lm_head::LMHeadLayer;
use crate::layers::rms_norm::RMSNormLayer;
use crate::llm::causal_self_attention::KVCache;
use crate::llm::decoder::DecoderLayer;

/// A causal language model whose caches are owned by the caller, so one
/// loaded model can serve several generations at once.
pub trait Model {
    /// Logits `(batch, seq, vocab)` for `input_ids`, the first of which sits
    /// at absolute `position`.
    fn forward_with_cache(
        &self,
        input_ids: &Tensor,
        kv_caches: &mut [KVCache],
        position: usize,
    ) -> CandleResult<Tensor>;

    fn num_layers(&self) -> usize;

    fn forward(&self, input_ids: &Tensor) -> CandleResult<Tensor> {
        let mut kv_caches = vec![KVCache::new(); self.num_layers()];
        self.forward_with_cache(input_ids, &mut kv_caches, 0)
    }
}

pub struct LlamaModel {
    pub device: Device,
    pub embed_layer: EmbeddingLayer,
    pub decoder_layers: Vec<DecoderLayer>,
    pub norm_layer: RMSNormLayer,
    pub lm_head: LMHeadLayer,
    pub cfg: LlamaConfig,
}

impl LlamaModel {
    pub fn new(
        weights: &MmapedSafetensors,
        config: &LlamaConfig,
        device: &Device,
        dtype: DType,
    ) -> CandleResult<Self> {
        let embed_layer = EmbeddingLayer::new(weights, "model.embed_tokens", device, dtype)?;

        let decoder_layers = (0..config.num_hidden_layers)
            .map(|layer_idx| {
                DecoderLayer::new(
                    weights,
                    &format!("model.layers.{}", layer_idx),
                    config,
                    device,
                    dtype,
                )
            })
            .collect::<CandleResult<Vec<_>>>()?;

        let norm_layer =
            RMSNormLayer::new(weights, "model.norm", device, dtype, config.rms_norm_eps)?;

        let lm_head = LMHeadLayer::new_or_tied(
            weights,
            "lm_head",
            embed_layer.weights(),
            device,
            dtype,
        )?;

        Ok(Self {
            device: device.clone(),
            embed_layer,
            decoder_layers,
            norm_layer,
            lm_head,
            cfg: config.clone(),
        })
    }
}

impl Model for LlamaModel {
    fn forward_with_cache(
        &self,
        input_ids: &Tensor,
        kv_caches: &mut [KVCache],
        position: usize,
    ) -> CandleResult<Tensor> {
        let input_ids = input_ids.to_device(&self.device)?;
        let mut hidden_states = self.embed_layer.forward(&input_ids)?;

        for (layer, kv_cache) in self.decoder_layers.iter().zip(kv_caches.iter_mut()) {
            hidden_states = layer.forward_with_cache(&hidden_states, kv_cache, position)?;
        }

        let normed_output = self.norm_layer.forward(&hidden_states)?;
        self.lm_head.forward(&normed_output)
    }

    fn num_layers(&self) -> usize {
        self.decoder_layers.len()
    }
}
