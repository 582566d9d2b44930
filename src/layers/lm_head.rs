use candle_core::safetensors::MmapedSafetensors;
use candle_core::{DType, Device, Result as CandleResult, Tensor};
use candle_nn::var_builder::SimpleBackend;

use crate::layers::layer::Layer;

/// Projection from hidden states to vocabulary logits.
pub struct LMHeadLayer {
    weights: Tensor,
    device: Device,
}

impl LMHeadLayer {
    pub fn new(
        weights: &MmapedSafetensors,
        prefix: &str,
        device: &Device,
        dtype: DType,
    ) -> CandleResult<Self> {
        let weights = weights
            .load(&format!("{}.weight", prefix), device)?
            .to_dtype(dtype)?;
        Ok(Self::from_tensor(weights, device))
    }

    /// Loads `prefix.weight`, or reuses `tied` when the checkpoint ties the
    /// head to the input embeddings and ships no separate head.
    pub fn new_or_tied(
        weights: &MmapedSafetensors,
        prefix: &str,
        tied: &Tensor,
        device: &Device,
        dtype: DType,
    ) -> CandleResult<Self> {
        if weights.contains_tensor(&format!("{}.weight", prefix)) {
            Self::new(weights, prefix, device, dtype)
        } else {
            Ok(Self::from_tensor(tied.clone(), device))
        }
    }

    fn from_tensor(weights: Tensor, device: &Device) -> Self {
        Self {
            weights,
            device: device.clone(),
        }
    }
}

impl Layer for LMHeadLayer {
    fn forward(&self, input: &Tensor) -> CandleResult<Tensor> {
        let input = input.to_device(&self.device)?;
        input.broadcast_matmul(&self.weights.t()?)
    }
}
