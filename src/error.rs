use thiserror::Error;

/// Failure reasons of the inference adapters.
///
/// The HTTP layer collapses every variant into one generic message; the
/// variants exist so the cause can be logged server-side.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("model hub error: {0}")]
    Hub(#[from] hf_hub::api::sync::ApiError),

    #[error("model config error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("inference task failed: {0}")]
    Task(String),
}

impl InferenceError {
    pub fn tokenizer(err: impl std::fmt::Display) -> Self {
        Self::Tokenizer(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, InferenceError>;
