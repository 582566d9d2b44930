pub mod activation;
pub mod embedding;
pub mod layer;
pub mod linear;
pub mod lm_head;
pub mod rms_norm;

#[cfg(test)]
pub(crate) mod test_utils {
    use std::collections::HashMap;

    use candle_core::safetensors::MmapedSafetensors;
    use candle_core::Tensor;
    use tempfile::TempDir;

    /// Writes `tensors` to a safetensors file and memory-maps it back.
    pub fn mmap_weights(tensors: Vec<(&str, Tensor)>) -> (TempDir, MmapedSafetensors) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        let map: HashMap<String, Tensor> = tensors
            .into_iter()
            .map(|(name, t)| (name.to_string(), t))
            .collect();
        candle_core::safetensors::save(&map, &path).unwrap();
        let weights = unsafe { MmapedSafetensors::new(&path).unwrap() };
        (dir, weights)
    }
}
