use candle_core::{safetensors::MmapedSafetensors, DType, Device, Result as CandleResult, Tensor};

use crate::layers::layer::Layer;

/// Token embedding table, `(vocab_size, hidden_size)`.
pub struct EmbeddingLayer {
    weights: Tensor,
    device: Device,
}

impl EmbeddingLayer {
    pub fn new(
        weights_map: &MmapedSafetensors,
        prefix: &str,
        device: &Device,
        dtype: DType,
    ) -> CandleResult<Self> {
        let weights = weights_map
            .load(&format!("{}.weight", prefix), device)?
            .to_dtype(dtype)?;

        Ok(Self {
            weights,
            device: device.clone(),
        })
    }

    pub fn weights(&self) -> &Tensor {
        &self.weights
    }
}

impl Layer for EmbeddingLayer {
    /// `(batch, seq)` token ids to `(batch, seq, hidden)` embeddings.
    fn forward(&self, input_ids: &Tensor) -> CandleResult<Tensor> {
        let input_ids = input_ids.to_device(&self.device)?;
        let (batch_size, seq_length) = input_ids.dims2()?;

        let flat_input = input_ids.reshape(batch_size * seq_length)?;
        let flat_embeddings = self.weights.index_select(&flat_input, 0)?;

        flat_embeddings.reshape((batch_size, seq_length, self.weights.dim(1)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::test_utils::mmap_weights;

    #[test]
    fn test_lookup_keeps_batch_shape() {
        let device = Device::Cpu;
        let table = Tensor::new(&[[0.0f32, 0.0], [1.0, 1.0], [2.0, 2.0]], &device).unwrap();
        let (_dir, weights) = mmap_weights(vec![("embed.weight", table)]);
        let layer = EmbeddingLayer::new(&weights, "embed", &device, DType::F32).unwrap();

        let ids = Tensor::new(&[[2u32, 0, 1]], &device).unwrap();
        let out = layer.forward(&ids).unwrap();
        assert_eq!(out.dims(), &[1, 3, 2]);
        assert_eq!(
            out.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            vec![2.0, 2.0, 0.0, 0.0, 1.0, 1.0]
        );
    }
}
