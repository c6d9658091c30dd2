//! HTTP API and browser UI over the synthesizer.
//!
//! Endpoints:
//! - GET  /                  browser UI
//! - GET  /health            `{"status": "ok"}`
//! - GET  /api/models        registered Piper voice keys
//! - POST /api/synthesize    text to an audio file (or chunks plus a ZIP)
//! - POST /api/extract       text from an uploaded .txt/.docx/.pdf
//! - GET  /api/files/:name   a file from the output directory

use crate::backends::piper::PiperParams;
use crate::chunking::{self, DEFAULT_CHUNK_SIZE};
use crate::dispatcher::{Backend, PiperOptions, SynthesisRequest, Synthesizer};
use crate::document::{self, ExtractOptions};
use crate::error::TtsError;
use crate::model_repo;
use axum::{
    extract::{rejection::JsonRejection, Path as AxumPath, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

const INDEX_HTML: &str = include_str!("../static/index.html");

#[derive(Clone)]
pub struct AppState {
    pub synth: Arc<Synthesizer>,
    pub output_dir: PathBuf,
    pub ocr_lang: String,
}

impl AppState {
    pub fn new(synth: Synthesizer, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            synth: Arc::new(synth),
            output_dir: output_dir.into(),
            ocr_lang: ExtractOptions::default().ocr_lang,
        }
    }

    pub fn with_ocr_lang(mut self, lang: impl Into<String>) -> Self {
        self.ocr_lang = lang.into();
        self
    }
}

/// An error response: `{"detail": "..."}` with a matching status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    pub fn unprocessable(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            detail: detail.into(),
        }
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: detail.into(),
        }
    }

    fn not_found(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            detail: detail.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, detail = %self.detail, "Request failed");
        }
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::unprocessable(rejection.body_text())
    }
}

fn default_backend() -> String {
    "pyttsx3".to_string()
}

fn default_lang() -> String {
    "en".to_string()
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

#[derive(Debug, Deserialize)]
pub struct SynthesizeBody {
    pub text: String,
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_lang")]
    pub lang: String,
    #[serde(default)]
    pub piper_model: Option<String>,
    #[serde(default)]
    pub length_scale: Option<f32>,
    #[serde(default)]
    pub noise_scale: Option<f32>,
    #[serde(default)]
    pub noise_w: Option<f32>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub chunking: bool,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum SynthesizeResponse {
    Single {
        status: &'static str,
        output: String,
    },
    Chunked {
        status: &'static str,
        outputs: Vec<String>,
        zip: String,
        message: String,
    },
}

#[derive(Debug, Deserialize)]
pub struct ExtractBody {
    pub filename: String,
    /// File contents, base64-encoded
    pub data: String,
    #[serde(default)]
    pub use_ocr: bool,
}

#[derive(Debug, Serialize)]
pub struct ExtractResponse {
    pub text: String,
    pub characters: usize,
}

/// Accepts a plain file name only; anything that could leave the output
/// directory is rejected.
pub fn check_filename(name: &str) -> Result<(), ApiError> {
    let bare = Path::new(name)
        .file_name()
        .is_some_and(|n| n == std::ffi::OsStr::new(name));
    if name.is_empty() || !bare || name.contains('\\') || name == "." || name == ".." {
        return Err(ApiError::unprocessable(format!(
            "Field 'filename' must be a plain file name, got '{}'",
            name
        )));
    }
    Ok(())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/api/models", get(list_models))
        .route("/api/synthesize", post(synthesize))
        .route("/api/extract", post(extract))
        .route("/api/files/:name", get(download_file))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn list_models() -> Json<serde_json::Value> {
    Json(json!({ "models": model_repo::model_keys() }))
}

async fn synthesize(
    State(state): State<AppState>,
    body: Result<Json<SynthesizeBody>, JsonRejection>,
) -> Result<Json<SynthesizeResponse>, ApiError> {
    let Json(body) = body?;

    let text = body.text.trim().to_string();
    if text.is_empty() {
        return Err(ApiError::unprocessable(
            "Field 'text' must be a non-empty string.",
        ));
    }
    let backend: Backend = body
        .backend
        .parse()
        .map_err(|e: TtsError| ApiError::unprocessable(e.to_string()))?;
    let piper_model = body.piper_model.filter(|m| !m.trim().is_empty());
    if backend == Backend::NeuralVoice && piper_model.is_none() {
        return Err(ApiError::unprocessable(
            "backend='piper' requires 'piper_model'.",
        ));
    }
    chunking::check_chunk_size(body.chunk_size)
        .map_err(|e| ApiError::unprocessable(e.to_string()))?;

    let filename = match body.filename {
        Some(name) => {
            check_filename(&name)?;
            name
        }
        None => format!("speech.{}", backend.extension()),
    };

    let req = SynthesisRequest::new(text, backend, state.output_dir.join(filename))
        .with_lang(body.lang)
        .with_piper(PiperOptions {
            model: piper_model.filter(|_| backend == Backend::NeuralVoice),
            params: PiperParams {
                length_scale: body.length_scale,
                noise_scale: body.noise_scale,
                noise_w: body.noise_w,
            },
        });
    let chunk_size = body.chunk_size;
    let chunked = body.chunking && req.text.chars().count() > chunk_size;
    let synth = state.synth.clone();

    let response = tokio::task::spawn_blocking(move || {
        if chunked {
            chunking::synthesize_chunked(&synth, &req, chunk_size).map(|out| {
                SynthesizeResponse::Chunked {
                    status: "ok",
                    message: format!("Saved {} chunks and ZIP.", out.outputs.len()),
                    outputs: out
                        .outputs
                        .iter()
                        .map(|p| p.display().to_string())
                        .collect(),
                    zip: out.zip.display().to_string(),
                }
            })
        } else {
            synth
                .synthesize(&req)
                .map(|path| SynthesizeResponse::Single {
                    status: "ok",
                    output: path.display().to_string(),
                })
        }
    })
    .await
    .map_err(|e| ApiError::internal(format!("Synthesis failed: {}", e)))?
    .map_err(|e| ApiError::internal(format!("Synthesis failed: {}", e)))?;

    Ok(Json(response))
}

async fn extract(
    State(state): State<AppState>,
    body: Result<Json<ExtractBody>, JsonRejection>,
) -> Result<Json<ExtractResponse>, ApiError> {
    let Json(body) = body?;
    let data = base64::engine::general_purpose::STANDARD
        .decode(body.data.trim())
        .map_err(|e| ApiError::unprocessable(format!("Field 'data' is not valid base64: {}", e)))?;
    let options = ExtractOptions {
        use_ocr: body.use_ocr,
        ocr_lang: state.ocr_lang.clone(),
    };
    let filename = body.filename;

    let text = tokio::task::spawn_blocking(move || {
        document::extract_text_from_bytes(&filename, &data, &options, &|msg: &str| {
            tracing::info!("{}", msg)
        })
    })
    .await
    .map_err(|e| ApiError::internal(format!("Extraction failed: {}", e)))?
    .map_err(|e| match e {
        TtsError::UnsupportedFileType(_) | TtsError::InvalidArgument(_) => {
            ApiError::unprocessable(e.to_string())
        }
        other => ApiError::internal(other.to_string()),
    })?;

    Ok(Json(ExtractResponse {
        characters: text.chars().count(),
        text,
    }))
}

fn content_type(name: &str) -> &'static str {
    match Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .as_deref()
    {
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
}

async fn download_file(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
) -> Result<Response, ApiError> {
    check_filename(&name)?;
    let path = state.output_dir.join(&name);
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok((
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, content_type(&name).to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", name),
                ),
            ],
            bytes,
        )
            .into_response()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(ApiError::not_found(format!("File not found: {}", name)))
        }
        Err(e) => Err(ApiError::internal(e.to_string())),
    }
}
