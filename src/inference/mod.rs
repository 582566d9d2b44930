//! Model adapters. Each one wraps a pretrained model's load and generate
//! calls behind a plain function contract; none of them share state.

pub mod code_summarization;
pub mod image_captioning;
pub mod text_generation;

use candle_core::{DType, Device};

use crate::error::Result;

pub use code_summarization::T5CodeSummarizer;
pub use image_captioning::BlipImageCaptioner;
pub use text_generation::LlamaTextGenerator;

/// Continues a prompt with a causal language model.
pub trait TextGenerator: Send + Sync {
    /// `max_length` bounds the whole sequence, prompt tokens included, and
    /// must be positive. The returned text starts with the prompt.
    fn generate(&self, input_text: &str, max_length: i64) -> Result<String>;
}

/// Produces a natural-language description of a block of source code.
pub trait CodeSummarizer: Send + Sync {
    fn summarize(&self, code_block: &str) -> Result<String>;
}

/// Describes an encoded image (PNG, JPEG, ...).
pub trait ImageCaptioner: Send + Sync {
    fn caption(&self, image: &[u8]) -> Result<String>;
}

pub fn select_device(cpu: bool) -> candle_core::Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else {
        Device::cuda_if_available(0)
    }
}

/// Half precision on GPU, f32 on CPU.
pub fn default_dtype(device: &Device) -> DType {
    if device.is_cuda() {
        DType::F16
    } else {
        DType::F32
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use std::path::Path;

    use tokenizers::Tokenizer;

    /// Word-level vocabulary matching the seven-token test models:
    /// `<unk> <s> </s>` are special, the rest are plain words.
    pub const TOKENIZER_JSON: &str = r#"{
  "version": "1.0",
  "truncation": null,
  "padding": null,
  "added_tokens": [
    {"id": 0, "content": "<unk>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
    {"id": 1, "content": "<s>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
    {"id": 2, "content": "</s>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true}
  ],
  "normalizer": null,
  "pre_tokenizer": {"type": "Whitespace"},
  "post_processor": null,
  "decoder": null,
  "model": {
    "type": "WordLevel",
    "vocab": {"<unk>": 0, "<s>": 1, "</s>": 2, "hello": 3, "world": 4, "def": 5, "add": 6},
    "unk_token": "<unk>"
  }
}"#;

    pub fn write_tokenizer(dir: &Path) {
        std::fs::write(dir.join("tokenizer.json"), TOKENIZER_JSON).unwrap();
    }

    pub fn tokenizer() -> Tokenizer {
        TOKENIZER_JSON.parse().unwrap()
    }
}
