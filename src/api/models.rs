use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    #[serde(rename = "Status")]
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct TextGenerationParams {
    pub input_text: String,
    pub max_length: i64,
}

#[derive(Debug, Serialize)]
pub struct TextGenerationResponse {
    pub input_text: String,
    pub max_length: i64,
    pub generated_text: String,
}

#[derive(Debug, Serialize)]
pub struct ImageCaptionResponse {
    #[serde(rename = "image caption")]
    pub image_caption: String,
}

#[derive(Debug, Deserialize)]
pub struct CodeSummaryParams {
    pub code_block: String,
}

#[derive(Debug, Serialize)]
pub struct CodeSummaryResponse {
    pub code_block: String,
    pub doc_string: String,
}

/// Body of every failed inference request.
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

/// Body of a request rejected before reaching a model.
#[derive(Debug, Serialize)]
pub struct ValidationResponse {
    pub detail: String,
}
