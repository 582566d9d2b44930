//! API error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::api::models::{MessageResponse, ValidationResponse};
use crate::error::InferenceError;

/// The only message clients see when inference fails, whatever the cause.
pub const GENERIC_ERROR_MESSAGE: &str = "There was an error uploading the file";

#[derive(Debug)]
pub enum ApiError {
    /// The request reached a model adapter (or the upload write) and failed.
    /// Answered with the generic message and a 200 status.
    Inference(InferenceError),
    /// The request could not be decoded into the endpoint's parameters.
    Validation(String),
    /// The upload exceeded the configured body limit.
    PayloadTooLarge(String),
}

impl From<InferenceError> for ApiError {
    fn from(err: InferenceError) -> Self {
        ApiError::Inference(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Inference(err) => {
                tracing::error!("Inference request failed: {}", err);
                let body = Json(MessageResponse {
                    message: GENERIC_ERROR_MESSAGE.to_string(),
                });
                (StatusCode::OK, body).into_response()
            }
            ApiError::Validation(detail) => {
                tracing::debug!("Rejected request: {}", detail);
                (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    Json(ValidationResponse { detail }),
                )
                    .into_response()
            }
            ApiError::PayloadTooLarge(detail) => {
                tracing::debug!("Rejected oversized upload: {}", detail);
                (
                    StatusCode::PAYLOAD_TOO_LARGE,
                    Json(ValidationResponse { detail }),
                )
                    .into_response()
            }
        }
    }
}
