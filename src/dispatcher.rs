//! Routes a synthesis request to the cloud client, the offline engine or
//! the Piper adapter.

use crate::backends::espeak::EspeakDriver;
use crate::backends::gtts::CloudTts;
use crate::backends::piper::{default_strategies, PiperAdapter, PiperParams};
use crate::backends::SpeechDriver;
use crate::config_loader::Settings;
use crate::engine::{OfflineEngine, DEFAULT_TIMEOUT_PER_1K_CHARS};
use crate::error::{Result, TtsError};
use crate::model_repo::ModelRepository;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// Remote speech service, MP3 out
    Cloud,
    /// OS-level speech driver, WAV out
    LocalDriver,
    /// Piper neural voice, WAV out
    NeuralVoice,
}

impl Backend {
    pub const ALL: [Backend; 3] = [Backend::Cloud, Backend::LocalDriver, Backend::NeuralVoice];

    /// Extension of the audio this backend writes, without the dot.
    pub fn extension(self) -> &'static str {
        match self {
            Backend::Cloud => "mp3",
            Backend::LocalDriver | Backend::NeuralVoice => "wav",
        }
    }

    /// Name used by the CLI and the HTTP API.
    pub fn id(self) -> &'static str {
        match self {
            Backend::Cloud => "gtts",
            Backend::LocalDriver => "pyttsx3",
            Backend::NeuralVoice => "piper",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Backend {
    type Err = TtsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "gtts" | "cloud" => Ok(Backend::Cloud),
            "pyttsx3" | "local" | "local-driver" | "espeak" => Ok(Backend::LocalDriver),
            "piper" | "neural-voice" => Ok(Backend::NeuralVoice),
            other => Err(TtsError::InvalidArgument(format!(
                "Unknown backend '{}'; expected one of gtts, pyttsx3, piper",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PiperOptions {
    /// Registry key or path of the voice model
    pub model: Option<String>,
    pub params: PiperParams,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest {
    pub text: String,
    pub backend: Backend,
    pub lang: String,
    pub out: PathBuf,
    pub piper: PiperOptions,
}

impl SynthesisRequest {
    pub fn new(text: impl Into<String>, backend: Backend, out: impl Into<PathBuf>) -> Self {
        Self {
            text: text.into(),
            backend,
            lang: "en".to_string(),
            out: out.into(),
            piper: PiperOptions::default(),
        }
    }

    pub fn with_lang(mut self, lang: impl Into<String>) -> Self {
        self.lang = lang.into();
        self
    }

    pub fn with_piper(mut self, piper: PiperOptions) -> Self {
        self.piper = piper;
        self
    }
}

/// Replaces the extension of `out` with the one `backend` produces.
pub fn normalize_output_path(out: &Path, backend: Backend) -> PathBuf {
    out.with_extension(backend.extension())
}

pub type DriverFactory = Box<dyn Fn() -> Box<dyn SpeechDriver> + Send + Sync>;

pub struct Synthesizer {
    cloud: CloudTts,
    offline: OnceLock<OfflineEngine>,
    driver_factory: DriverFactory,
    piper: PiperAdapter,
    timeout_per_1k_chars: f64,
}

impl Synthesizer {
    pub fn new(cloud: CloudTts, driver_factory: DriverFactory, piper: PiperAdapter) -> Self {
        Self {
            cloud,
            offline: OnceLock::new(),
            driver_factory,
            piper,
            timeout_per_1k_chars: DEFAULT_TIMEOUT_PER_1K_CHARS,
        }
    }

    pub fn with_timeout_per_1k_chars(mut self, secs: f64) -> Self {
        self.timeout_per_1k_chars = secs;
        self
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let timeout = Duration::from_secs(settings.download_timeout_secs);
        let repo = ModelRepository::new(settings.models_dir(), settings.model_base_url.clone())
            .with_min_model_size(settings.min_model_size_bytes)
            .with_timeout(timeout);
        let piper = PiperAdapter::new(
            repo,
            default_strategies(&settings.piper_binary, &settings.espeak_binary),
        );
        let espeak_binary = settings.espeak_binary.clone();

        Self::new(
            CloudTts::new(settings.cloud_tts_url.clone()).with_timeout(timeout),
            Box::new(move || -> Box<dyn SpeechDriver> {
                Box::new(EspeakDriver::new(espeak_binary.clone()))
            }),
            piper,
        )
        .with_timeout_per_1k_chars(settings.offline_timeout_per_1k_chars)
    }

    /// The offline engine, created on the first local-driver request.
    fn offline(&self) -> &OfflineEngine {
        self.offline.get_or_init(|| {
            OfflineEngine::new((self.driver_factory)())
                .with_timeout_per_1k_chars(self.timeout_per_1k_chars)
        })
    }

    /// Synthesizes `req` and returns the path actually written.
    pub fn synthesize(&self, req: &SynthesisRequest) -> Result<PathBuf> {
        if req.text.trim().is_empty() {
            return Err(TtsError::InvalidArgument("Text must not be empty".into()));
        }
        let piper_model = match req.backend {
            Backend::NeuralVoice => Some(
                req.piper
                    .model
                    .as_deref()
                    .filter(|m| !m.trim().is_empty())
                    .ok_or_else(|| {
                        TtsError::InvalidArgument(
                            "The piper backend needs a model key or path".into(),
                        )
                    })?,
            ),
            _ => None,
        };

        let mut out = normalize_output_path(&req.out, req.backend);
        if out.is_relative() {
            out = std::env::current_dir()?.join(out);
        }
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!(
            backend = %req.backend,
            chars = req.text.chars().count(),
            out = %out.display(),
            "Synthesizing"
        );

        match (req.backend, piper_model) {
            (Backend::Cloud, _) => self.cloud.synthesize(&req.text, &req.lang, &out),
            (Backend::LocalDriver, _) => {
                let lang = Some(req.lang.as_str()).filter(|l| !l.is_empty());
                self.offline().synthesize_to_wav(&req.text, &out, lang)
            }
            (Backend::NeuralVoice, Some(model)) => {
                self.piper
                    .tts_piper(&req.text, model, &out, &req.piper.params)
            }
            (Backend::NeuralVoice, None) => Err(TtsError::InvalidArgument(
                "The piper backend needs a model key or path".into(),
            )),
        }
    }
}
