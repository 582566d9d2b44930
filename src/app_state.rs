use std::path::PathBuf;
use std::sync::Arc;

use candle_core::Device;

use crate::config::Config;
use crate::error::Result;
use crate::inference::{
    BlipImageCaptioner, CodeSummarizer, ImageCaptioner, LlamaTextGenerator, T5CodeSummarizer,
    TextGenerator,
};

/// Everything the handlers share. Built once at startup and never mutated.
pub struct AppState {
    pub text_generator: Arc<dyn TextGenerator>,
    pub code_summarizer: Arc<dyn CodeSummarizer>,
    pub image_captioner: Arc<dyn ImageCaptioner>,
    /// Where uploaded images are written.
    pub upload_dir: PathBuf,
}

impl AppState {
    /// Loads the text generation and code summarization models. The
    /// captioning model is only read per request.
    pub fn load(config: &Config, device: &Device) -> Result<Self> {
        let text_generator = LlamaTextGenerator::load(&config.text_generation, device)?;
        let code_summarizer = T5CodeSummarizer::load(&config.code_summarization, device)?;
        let image_captioner = BlipImageCaptioner::new(&config.image_captioning, device);

        Ok(Self {
            text_generator: Arc::new(text_generator),
            code_summarizer: Arc::new(code_summarizer),
            image_captioner: Arc::new(image_captioner),
            upload_dir: config.upload_dir.clone(),
        })
    }
}
