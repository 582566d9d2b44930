use axum::{
    body::Bytes,
    extract::{
        multipart::{MultipartError, MultipartRejection},
        rejection::QueryRejection,
        Multipart, Query, State,
    },
    http::StatusCode,
    Json,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::api::models::{
    CodeSummaryParams, CodeSummaryResponse, HealthResponse, ImageCaptionResponse,
    TextGenerationParams, TextGenerationResponse,
};
use crate::app_state::AppState;
use crate::error::InferenceError;

const IMAGE_FIELD: &str = "image";

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "Ok".to_string(),
    })
}

pub async fn text_generation(
    State(state): State<Arc<AppState>>,
    params: Result<Query<TextGenerationParams>, QueryRejection>,
) -> Result<(StatusCode, Json<TextGenerationResponse>), ApiError> {
    let Query(params) = params.map_err(|e| ApiError::Validation(e.body_text()))?;
    tracing::info!(
        "Text generation request: {} chars, max_length {}",
        params.input_text.len(),
        params.max_length
    );

    let generator = state.text_generator.clone();
    let input_text = params.input_text.clone();
    let max_length = params.max_length;
    let generated_text = run_blocking(move || generator.generate(&input_text, max_length)).await?;

    Ok((
        StatusCode::CREATED,
        Json(TextGenerationResponse {
            input_text: params.input_text,
            max_length,
            generated_text,
        }),
    ))
}

pub async fn image_captioning(
    State(state): State<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<(StatusCode, Json<ImageCaptionResponse>), ApiError> {
    let mut multipart = multipart.map_err(|e| ApiError::Validation(e.body_text()))?;
    let upload = read_image_field(&mut multipart).await?;
    tracing::info!(
        "Image captioning request: {} ({} bytes)",
        upload.file_name,
        upload.bytes.len()
    );

    let path = save_upload(&state.upload_dir, &upload.file_name, &upload.bytes).await?;
    tracing::debug!("Stored upload at {:?}", path);

    let captioner = state.image_captioner.clone();
    let bytes = upload.bytes;
    let caption = run_blocking(move || captioner.caption(&bytes)).await?;

    Ok((
        StatusCode::CREATED,
        Json(ImageCaptionResponse {
            image_caption: caption,
        }),
    ))
}

pub async fn code_summary(
    State(state): State<Arc<AppState>>,
    params: Result<Query<CodeSummaryParams>, QueryRejection>,
) -> Result<(StatusCode, Json<CodeSummaryResponse>), ApiError> {
    let Query(params) = params.map_err(|e| ApiError::Validation(e.body_text()))?;
    tracing::info!("Code summary request: {} chars", params.code_block.len());

    let summarizer = state.code_summarizer.clone();
    let code_block = params.code_block.clone();
    let doc_string = run_blocking(move || summarizer.summarize(&code_block)).await?;

    Ok((
        StatusCode::CREATED,
        Json(CodeSummaryResponse {
            code_block: params.code_block,
            doc_string,
        }),
    ))
}

struct ImageUpload {
    file_name: String,
    bytes: Bytes,
}

async fn read_image_field(multipart: &mut Multipart) -> Result<ImageUpload, ApiError> {
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }
        let file_name = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| ApiError::Validation("image must be a file upload".to_string()))?;
        let bytes = field.bytes().await.map_err(multipart_error)?;
        return Ok(ImageUpload { file_name, bytes });
    }
    Err(ApiError::Validation("field required: image".to_string()))
}

fn multipart_error(err: MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge(err.body_text())
    } else {
        ApiError::Validation(err.body_text())
    }
}

/// Writes the upload under its client-supplied name inside `upload_dir`,
/// replacing any earlier file of the same name. Directory components of the
/// name are dropped.
async fn save_upload(
    upload_dir: &Path,
    file_name: &str,
    bytes: &[u8],
) -> Result<PathBuf, InferenceError> {
    let name = Path::new(file_name).file_name().ok_or_else(|| {
        InferenceError::InvalidInput(format!("unusable upload filename {:?}", file_name))
    })?;
    let path = upload_dir.join(name);
    tokio::fs::write(&path, bytes).await?;
    Ok(path)
}

/// Runs a model call on the blocking pool so inference does not stall the
/// async workers.
async fn run_blocking<T, F>(f: F) -> Result<T, InferenceError>
where
    F: FnOnce() -> Result<T, InferenceError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| InferenceError::Task(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::error::GENERIC_ERROR_MESSAGE;
    use crate::api::server::create_router;
    use crate::error::Result;
    use crate::inference::{CodeSummarizer, ImageCaptioner, TextGenerator};
    use axum_test::multipart::{MultipartForm, Part};
    use axum_test::TestServer;
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct EchoGenerator;

    impl TextGenerator for EchoGenerator {
        fn generate(&self, input_text: &str, max_length: i64) -> Result<String> {
            if max_length <= 0 {
                return Err(InferenceError::InvalidInput("max_length".into()));
            }
            Ok(format!("{input_text} once upon a time"))
        }
    }

    struct FixedSummarizer;

    impl CodeSummarizer for FixedSummarizer {
        fn summarize(&self, _code_block: &str) -> Result<String> {
            Ok("Adds two numbers.".to_string())
        }
    }

    #[derive(Default)]
    struct RecordingCaptioner {
        seen: Mutex<Vec<Vec<u8>>>,
    }

    impl ImageCaptioner for RecordingCaptioner {
        fn caption(&self, image: &[u8]) -> Result<String> {
            self.seen.lock().unwrap().push(image.to_vec());
            Ok("a cat sitting on a couch".to_string())
        }
    }

    struct Broken;

    impl TextGenerator for Broken {
        fn generate(&self, _: &str, _: i64) -> Result<String> {
            Err(InferenceError::Model(candle_core::Error::Msg("weights missing".into())))
        }
    }

    impl CodeSummarizer for Broken {
        fn summarize(&self, _: &str) -> Result<String> {
            Err(InferenceError::Tokenizer("bad input".into()))
        }
    }

    impl ImageCaptioner for Broken {
        fn caption(&self, _: &[u8]) -> Result<String> {
            Err(InferenceError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "result/model.safetensors",
            )))
        }
    }

    struct TestApp {
        server: TestServer,
        uploads: TempDir,
        captioner: Arc<RecordingCaptioner>,
    }

    fn working_app() -> TestApp {
        let uploads = tempfile::tempdir().unwrap();
        let captioner = Arc::new(RecordingCaptioner::default());
        let state = AppState {
            text_generator: Arc::new(EchoGenerator),
            code_summarizer: Arc::new(FixedSummarizer),
            image_captioner: captioner.clone(),
            upload_dir: uploads.path().to_path_buf(),
        };
        let server = TestServer::new(create_router(Arc::new(state), 1024 * 1024)).unwrap();
        TestApp {
            server,
            uploads,
            captioner,
        }
    }

    fn broken_app() -> (TestServer, TempDir) {
        let uploads = tempfile::tempdir().unwrap();
        let state = AppState {
            text_generator: Arc::new(Broken),
            code_summarizer: Arc::new(Broken),
            image_captioner: Arc::new(Broken),
            upload_dir: uploads.path().to_path_buf(),
        };
        let server = TestServer::new(create_router(Arc::new(state), 1024 * 1024)).unwrap();
        (server, uploads)
    }

    fn image_form(file_name: &str, bytes: &[u8]) -> MultipartForm {
        MultipartForm::new().add_part(
            "image",
            Part::bytes(bytes.to_vec())
                .file_name(file_name)
                .mime_type("image/png"),
        )
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = working_app();
        let response = app.server.get("/").await;
        response.assert_status(StatusCode::OK);
        response.assert_json(&json!({"Status": "Ok"}));
    }

    #[tokio::test]
    async fn test_health_check_independent_of_models() {
        let (server, _uploads) = broken_app();
        let response = server.get("/").await;
        response.assert_status(StatusCode::OK);
        response.assert_json(&json!({"Status": "Ok"}));
    }

    #[tokio::test]
    async fn test_text_generation_created() {
        let app = working_app();
        let response = app
            .server
            .post("/text_generation")
            .add_query_param("input_text", "Hello, my name is")
            .add_query_param("max_length", 30)
            .await;

        response.assert_status(StatusCode::CREATED);
        response.assert_json(&json!({
            "input_text": "Hello, my name is",
            "max_length": 30,
            "generated_text": "Hello, my name is once upon a time",
        }));
    }

    #[tokio::test]
    async fn test_text_generation_invalid_max_length_gets_generic_message() {
        let app = working_app();
        let response = app
            .server
            .post("/text_generation")
            .add_query_param("input_text", "Hello")
            .add_query_param("max_length", -1)
            .await;

        response.assert_status(StatusCode::OK);
        response.assert_json(&json!({"message": GENERIC_ERROR_MESSAGE}));
    }

    #[tokio::test]
    async fn test_text_generation_missing_param_rejected() {
        let app = working_app();
        let response = app
            .server
            .post("/text_generation")
            .add_query_param("input_text", "Hello")
            .await;

        response.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
        let body: Value = response.json();
        assert!(body["detail"].as_str().unwrap().contains("max_length"));
    }

    #[tokio::test]
    async fn test_code_summary_echoes_code_verbatim() {
        let app = working_app();
        let code = "def add(a, b):\n    return a + b  # sum & more";
        let response = app
            .server
            .post("/code_summary")
            .add_query_param("code_block", code)
            .await;

        response.assert_status(StatusCode::CREATED);
        response.assert_json(&json!({
            "code_block": code,
            "doc_string": "Adds two numbers.",
        }));
    }

    #[tokio::test]
    async fn test_image_captioning_persists_upload() {
        let app = working_app();
        let bytes = b"\x89PNG\r\n\x1a\nfake image payload".to_vec();

        let response = app
            .server
            .post("/image_captioning")
            .multipart(image_form("cat.png", &bytes))
            .await;

        response.assert_status(StatusCode::CREATED);
        response.assert_json(&json!({"image caption": "a cat sitting on a couch"}));

        let stored = std::fs::read(app.uploads.path().join("cat.png")).unwrap();
        assert_eq!(stored, bytes);
        assert_eq!(*app.captioner.seen.lock().unwrap(), vec![bytes]);
    }

    #[tokio::test]
    async fn test_image_captioning_same_name_overwrites() {
        let app = working_app();
        for payload in [b"first upload, longer".as_slice(), b"second".as_slice()] {
            app.server
                .post("/image_captioning")
                .multipart(image_form("photo.jpg", payload))
                .await
                .assert_status(StatusCode::CREATED);
        }

        let stored = std::fs::read(app.uploads.path().join("photo.jpg")).unwrap();
        assert_eq!(stored, b"second");
    }

    #[tokio::test]
    async fn test_image_captioning_strips_directories_from_filename() {
        let app = working_app();
        app.server
            .post("/image_captioning")
            .multipart(image_form("../../escape.png", b"payload"))
            .await
            .assert_status(StatusCode::CREATED);

        assert!(app.uploads.path().join("escape.png").is_file());
        assert!(!app.uploads.path().parent().unwrap().join("escape.png").exists());
    }

    #[tokio::test]
    async fn test_image_captioning_unusable_filename_gets_generic_message() {
        let app = working_app();
        let response = app
            .server
            .post("/image_captioning")
            .multipart(image_form("..", b"payload"))
            .await;

        response.assert_status(StatusCode::OK);
        response.assert_json(&json!({"message": GENERIC_ERROR_MESSAGE}));
        assert!(app.captioner.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_image_captioning_oversized_upload_rejected() {
        let app = working_app();
        let response = app
            .server
            .post("/image_captioning")
            .multipart(image_form("huge.png", &vec![0u8; 2 * 1024 * 1024]))
            .await;

        response.assert_status(StatusCode::PAYLOAD_TOO_LARGE);
        assert!(app.captioner.seen.lock().unwrap().is_empty());
        assert!(!app.uploads.path().join("huge.png").exists());
    }

    #[tokio::test]
    async fn test_image_captioning_missing_field_rejected() {
        let app = working_app();
        let response = app
            .server
            .post("/image_captioning")
            .multipart(MultipartForm::new().add_text("caption", "none"))
            .await;

        response.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
        response.assert_json(&json!({"detail": "field required: image"}));
    }

    #[tokio::test]
    async fn test_model_failures_collapse_to_generic_message() {
        let (server, uploads) = broken_app();
        let expected = json!({"message": GENERIC_ERROR_MESSAGE});

        let text = server
            .post("/text_generation")
            .add_query_param("input_text", "Hello")
            .add_query_param("max_length", 20)
            .await;
        let code = server
            .post("/code_summary")
            .add_query_param("code_block", "fn main() {}")
            .await;
        let image = server
            .post("/image_captioning")
            .multipart(image_form("dog.png", b"payload"))
            .await;

        for response in [text, code, image] {
            response.assert_status(StatusCode::OK);
            response.assert_json(&expected);
        }

        // the upload is written before the captioner runs
        assert_eq!(std::fs::read(uploads.path().join("dog.png")).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_save_upload_rejects_empty_name() {
        let dir = tempfile::tempdir().unwrap();
        let err = save_upload(dir.path(), "", b"x").await.unwrap_err();
        assert!(matches!(err, InferenceError::InvalidInput(_)));
    }
}
