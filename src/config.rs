use std::path::PathBuf;

use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Command line arguments. Everything else lives in the config file.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "ML_SERVE_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without loading any model.
    #[arg(long)]
    pub validate: bool,
}

/// Service configuration, loaded from YAML and `ML_SERVE_*` environment variables.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Directory uploaded images are written to.
    pub upload_dir: PathBuf,
    /// Request body limit for image uploads.
    pub max_upload_bytes: usize,
    /// Run on CPU even when a CUDA device is available.
    pub cpu: bool,
    pub text_generation: TextGenerationConfig,
    pub code_summarization: CodeSummarizationConfig,
    pub image_captioning: ImageCaptioningConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TextGenerationConfig {
    /// Hub repo id or local directory holding `model.safetensors`, `tokenizer.json` and `config.json`.
    pub model: String,
    /// Sampling temperature. Greedy decoding when unset.
    pub temperature: Option<f64>,
    pub seed: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CodeSummarizationConfig {
    /// Hub repo id or local directory of a T5 checkpoint.
    pub model: String,
    /// Weights file inside the checkpoint, safetensors or a PyTorch `.bin`.
    pub weights_file: String,
    /// Upper bound on the decoder sequence, start token included.
    pub max_length: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImageCaptioningConfig {
    /// Local directory the captioning model is read from on every request.
    pub model_dir: PathBuf,
    /// Upper bound on the caption sequence, start token included.
    pub max_length: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            upload_dir: PathBuf::from("."),
            max_upload_bytes: 20 * 1024 * 1024,
            cpu: false,
            text_generation: TextGenerationConfig::default(),
            code_summarization: CodeSummarizationConfig::default(),
            image_captioning: ImageCaptioningConfig::default(),
        }
    }
}

impl Default for TextGenerationConfig {
    fn default() -> Self {
        Self {
            model: "TinyLlama/TinyLlama-1.1B-Chat-v1.0".to_string(),
            temperature: None,
            seed: 42,
        }
    }
}

impl Default for CodeSummarizationConfig {
    fn default() -> Self {
        Self {
            model: "Salesforce/codet5-small".to_string(),
            weights_file: "pytorch_model.bin".to_string(),
            max_length: 20,
        }
    }
}

impl Default for ImageCaptioningConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("result"),
            max_length: 50,
        }
    }
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(figment::Error::from)?;
        Ok(config)
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Yaml::file(&args.config))
            // ML_SERVE_CONFIG names the file itself
            .merge(Env::prefixed("ML_SERVE_").ignore(&["config"]).split("__"))
    }

    fn validate(&self) -> Result<(), String> {
        if self.port == 0 {
            return Err("port must be non-zero".to_string());
        }
        if self.code_summarization.max_length == 0 {
            return Err("code_summarization.max_length must be positive".to_string());
        }
        if self.image_captioning.max_length == 0 {
            return Err("image_captioning.max_length must be positive".to_string());
        }
        if matches!(self.text_generation.temperature, Some(t) if t <= 0.0) {
            return Err("text_generation.temperature must be positive".to_string());
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// `config.json` of a Llama-family checkpoint. Unknown keys are ignored.
#[derive(Deserialize, Debug, Clone)]
pub struct LlamaConfig {
    pub eos_token_id: u32,
    #[serde(rename = "hidden_act", default = "default_hidden_act")]
    pub hidden_activation: String,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    /// Longest sequence the model supports; caps `max_length`.
    pub max_position_embeddings: usize,
    pub num_attention_heads: usize,
    pub num_hidden_layers: usize,
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,
}

fn default_hidden_act() -> String {
    "silu".to_string()
}

fn default_rope_theta() -> f32 {
    10_000.0
}

impl LlamaConfig {
    pub fn num_key_value_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }
}
