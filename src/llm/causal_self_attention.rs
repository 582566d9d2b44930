use candle_core::safetensors::MmapedSafetensors;
use candle_core::Result as CandleResult;
use candle_core::{DType, Device, Tensor, D};

use crate::config::LlamaConfig;
use crate::layers::layer::Layer;
use crate::layers::linear::LinearLayer;

/// Keys and values of the tokens already seen by one attention layer,
/// shaped `(batch, n_kv_heads, seq, head_dim)`.
#[derive(Clone, Default)]
pub struct KVCache {
    pub k_cache: Option<Tensor>,
    pub v_cache: Option<Tensor>,
}

impl KVCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached positions.
    #[cfg(test)]
    pub(crate) fn len(&self) -> CandleResult<usize> {
        match &self.k_cache {
            Some(k) => k.dim(2),
            None => Ok(0),
        }
    }

    /// Appends the new keys/values and returns the full sequences.
    fn append(&mut self, k: Tensor, v: Tensor) -> CandleResult<(Tensor, Tensor)> {
        let k = match &self.k_cache {
            Some(cached) => Tensor::cat(&[cached, &k], 2)?,
            None => k,
        };
        let v = match &self.v_cache {
            Some(cached) => Tensor::cat(&[cached, &v], 2)?,
            None => v,
        };
        self.k_cache = Some(k.clone());
        self.v_cache = Some(v.clone());
        Ok((k, v))
    }
}

pub struct CausalSelfAttentionLayer {
    q_proj: LinearLayer,
    k_proj: LinearLayer,
    v_proj: LinearLayer,
    o_proj: LinearLayer,
    n_heads: usize,
    n_kv_heads: usize,
    head_dim: usize,
    /// `theta^(-2i/head_dim)` for `i in 0..head_dim/2`.
    inv_freq: Tensor,
    dtype: DType,
    device: Device,
}

impl CausalSelfAttentionLayer {
    pub fn new(
        weights: &MmapedSafetensors,
        prefix: &str,
        config: &LlamaConfig,
        device: &Device,
        dtype: DType,
    ) -> CandleResult<Self> {
        let q_proj = LinearLayer::new(weights, &format!("{}.q_proj", prefix), device, dtype)?;
        let k_proj = LinearLayer::new(weights, &format!("{}.k_proj", prefix), device, dtype)?;
        let v_proj = LinearLayer::new(weights, &format!("{}.v_proj", prefix), device, dtype)?;
        let o_proj = LinearLayer::new(weights, &format!("{}.o_proj", prefix), device, dtype)?;

        let head_dim = config.head_dim();
        let inv_freq: Vec<f32> = (0..head_dim / 2)
            .map(|i| 1.0 / config.rope_theta.powf(2.0 * i as f32 / head_dim as f32))
            .collect();
        let inv_freq = Tensor::new(inv_freq.as_slice(), device)?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            n_heads: config.num_attention_heads,
            n_kv_heads: config.num_key_value_heads(),
            head_dim,
            inv_freq,
            dtype,
            device: device.clone(),
        })
    }

    fn rotate_half(x: &Tensor) -> CandleResult<Tensor> {
        let last_dim = x.dim(D::Minus1)?;
        let xs1 = x.narrow(D::Minus1, 0, last_dim / 2)?;
        let xs2 = x.narrow(D::Minus1, last_dim / 2, last_dim - last_dim / 2)?;
        Tensor::cat(&[&xs2.neg()?, &xs1], D::Minus1)
    }

    /// Rotary embeddings for the tokens at absolute positions
    /// `position..position + seq_len`.
    fn apply_rotary_emb(
        &self,
        q: &Tensor,
        k: &Tensor,
        position: usize,
        seq_len: usize,
    ) -> CandleResult<(Tensor, Tensor)> {
        let t = Tensor::arange(position as u32, (position + seq_len) as u32, &self.device)?
            .to_dtype(DType::F32)?;

        // (seq_len, head_dim / 2)
        let freqs = t.unsqueeze(1)?.broadcast_mul(&self.inv_freq.unsqueeze(0)?)?;
        // (seq_len, head_dim)
        let emb = Tensor::cat(&[&freqs, &freqs], 1)?;

        let cos = emb.cos()?.to_dtype(self.dtype)?;
        let sin = emb.sin()?.to_dtype(self.dtype)?;

        // x' = x * cos + rotate_half(x) * sin
        let q_rotated = (q.broadcast_mul(&cos)? + Self::rotate_half(q)?.broadcast_mul(&sin)?)?;
        let k_rotated = (k.broadcast_mul(&cos)? + Self::rotate_half(k)?.broadcast_mul(&sin)?)?;

        Ok((q_rotated, k_rotated))
    }

    fn repeat_kv(x: Tensor, n_rep: usize) -> CandleResult<Tensor> {
        if n_rep == 1 {
            return Ok(x);
        }

        let (b_sz, n_kv_heads, seq_len, head_dim) = x.dims4()?;
        x.unsqueeze(2)?
            .expand((b_sz, n_kv_heads, n_rep, seq_len, head_dim))?
            .reshape((b_sz, n_kv_heads * n_rep, seq_len, head_dim))
    }

    /// Mask for `seq_len` queries placed after `total_len - seq_len` cached
    /// tokens. Query `i` may attend to keys `0..=offset + i`.
    fn causal_mask(&self, seq_len: usize, total_len: usize) -> CandleResult<Tensor> {
        let offset = total_len - seq_len;
        let mask: Vec<f32> = (0..seq_len)
            .flat_map(|i| {
                (0..total_len).map(move |j| {
                    if j > i + offset {
                        f32::NEG_INFINITY
                    } else {
                        0.0
                    }
                })
            })
            .collect();

        Tensor::from_vec(mask, (seq_len, total_len), &self.device)?
            .to_dtype(self.dtype)?
            .unsqueeze(0)?
            .unsqueeze(0)
    }

    /// Attends the new tokens in `input` over the cached ones plus
    /// themselves. `position` is the absolute index of the first new token.
    pub fn forward_with_cache(
        &self,
        input: &Tensor,
        kv_cache: &mut KVCache,
        position: usize,
    ) -> CandleResult<Tensor> {
        let input = input.to_device(&self.device)?;
        let (b_sz, seq_len, hidden_size) = input.dims3()?;

        let q = self
            .q_proj
            .forward(&input)?
            .reshape((b_sz, seq_len, self.n_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = self
            .k_proj
            .forward(&input)?
            .reshape((b_sz, seq_len, self.n_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = self
            .v_proj
            .forward(&input)?
            .reshape((b_sz, seq_len, self.n_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let (q, k) = self.apply_rotary_emb(&q, &k, position, seq_len)?;
        let (k, v) = kv_cache.append(k, v)?;
        let total_len = k.dim(2)?;

        let n_rep = self.n_heads / self.n_kv_heads;
        let k = Self::repeat_kv(k, n_rep)?.contiguous()?;
        let v = Self::repeat_kv(v, n_rep)?.contiguous()?;

        let scaling = 1.0 / (self.head_dim as f64).sqrt();
        let attn_scores = q.matmul(&k.t()?.contiguous()?)?.affine(scaling, 0.0)?;

        // a single new token may see everything before it
        let attn_scores = if seq_len > 1 {
            attn_scores.broadcast_add(&self.causal_mask(seq_len, total_len)?)?
        } else {
            attn_scores
        };

        let attn_probs = candle_nn::ops::softmax(&attn_scores.to_dtype(DType::F32)?, D::Minus1)?
            .to_dtype(self.dtype)?;

        let context = attn_probs
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b_sz, seq_len, hidden_size))?;

        self.o_proj.forward(&context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kv_cache_grows() {
        let device = Device::Cpu;
        let mut cache = KVCache::new();
        assert_eq!(cache.len().unwrap(), 0);

        let kv = Tensor::zeros((1, 2, 3, 4), DType::F32, &device).unwrap();
        cache.append(kv.clone(), kv.clone()).unwrap();
        let (k, v) = cache
            .append(kv.narrow(2, 0, 1).unwrap(), kv.narrow(2, 0, 1).unwrap())
            .unwrap();
        assert_eq!(k.dims(), &[1, 2, 4, 4]);
        assert_eq!(v.dims(), &[1, 2, 4, 4]);
        assert_eq!(cache.len().unwrap(), 4);
    }

    #[test]
    fn test_rotate_half() {
        let x = Tensor::new(&[[1.0f32, 2.0, 3.0, 4.0]], &Device::Cpu).unwrap();
        let rotated = CausalSelfAttentionLayer::rotate_half(&x).unwrap();
        assert_eq!(
            rotated.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            vec![-3.0, -4.0, 1.0, 2.0]
        );
    }

    #[test]
    fn test_repeat_kv_duplicates_heads_in_order() {
        let x = Tensor::arange(0f32, 4.0, &Device::Cpu)
            .unwrap()
            .reshape((1, 2, 1, 2))
            .unwrap();
        let repeated = CausalSelfAttentionLayer::repeat_kv(x, 2).unwrap();
        assert_eq!(repeated.dims(), &[1, 4, 1, 2]);
        assert_eq!(
            repeated.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            vec![0.0, 1.0, 0.0, 1.0, 2.0, 3.0, 2.0, 3.0]
        );
    }
}
