use std::path::PathBuf;
use std::time::Duration;

/// Failures surfaced by every synthesis path, the model repository and
/// the document extractor. Front ends display the message verbatim.
#[derive(thiserror::Error, Debug)]
pub enum TtsError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unknown model key: {0}")]
    UnknownModelKey(String),

    #[error("{} is not a usable voice model: {reason}", path.display())]
    InvalidModelArtifact { path: PathBuf, reason: String },

    #[error("{0} not found on PATH")]
    ExternalToolMissing(String),

    #[error("{tool} exited with {status}: {stderr}")]
    ExternalToolFailed {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("{backend} did not produce audio at: {}", path.display())]
    SynthesisProducedNoOutput {
        backend: &'static str,
        path: PathBuf,
    },

    #[error("{backend} synthesis timed out after {:.1}s", timeout.as_secs_f64())]
    Timeout {
        backend: &'static str,
        timeout: Duration,
    },

    #[error("Unsupported file type: {0}. Supported: .pdf, .docx, .txt")]
    UnsupportedFileType(String),

    #[error("Failed to fetch {url}: {reason}")]
    Download { url: String, reason: String },

    #[error("Voice runtime error: {0}")]
    Runtime(String),

    #[error("Text extraction failed: {0}")]
    Extraction(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, TtsError>;
