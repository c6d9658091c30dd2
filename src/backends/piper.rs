//! Piper neural voices: reference resolution, model validation and an
//! ordered list of synthesis strategies (in-process runtime, then CLI).

use super::{find_on_path, run_with_input};
use crate::engine::file_has_content;
use crate::error::{Result, TtsError};
use crate::model_repo::{self, ModelRepository};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Optional inference overrides; `None` keeps the voice's own default.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PiperParams {
    pub length_scale: Option<f32>,
    pub noise_scale: Option<f32>,
    pub noise_w: Option<f32>,
}

/// A model file and its JSON sidecar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModel {
    pub model: PathBuf,
    pub config: PathBuf,
}

impl ResolvedModel {
    /// Pairs `model` with the sidecar Piper expects next to it.
    pub fn from_model_path(model: impl Into<PathBuf>) -> Self {
        let model = model.into();
        let mut config = model.as_os_str().to_owned();
        config.push(".json");
        Self {
            model,
            config: PathBuf::from(config),
        }
    }
}

/// How an in-process runtime wants to be called. Read once when the
/// strategy is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeCapability {
    Streaming { accepts_params: bool },
    Batch { accepts_params: bool },
}

impl RuntimeCapability {
    fn accepts_params(self) -> bool {
        match self {
            RuntimeCapability::Streaming { accepts_params }
            | RuntimeCapability::Batch { accepts_params } => accepts_params,
        }
    }
}

/// Output of a batch synthesis call.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchAudio {
    /// Already a complete WAV file
    Wav(Vec<u8>),
    /// Mono 16-bit samples plus their rate
    Pcm { samples: Vec<i16>, sample_rate: u32 },
}

/// An in-process neural voice runtime.
pub trait VoiceRuntime: Send + Sync {
    fn name(&self) -> &'static str;

    fn capability(&self) -> RuntimeCapability;

    fn load(&self, model: &ResolvedModel) -> Result<Box<dyn LoadedVoice>>;
}

/// A voice loaded by a `VoiceRuntime`. Only the method matching the
/// runtime's capability is called.
pub trait LoadedVoice {
    fn sample_rate(&self) -> u32;

    fn synthesize_stream(
        &mut self,
        text: &str,
        params: Option<&PiperParams>,
        on_chunk: &mut dyn FnMut(&[i16]) -> Result<()>,
    ) -> Result<()>;

    fn synthesize_batch(&mut self, text: &str, params: Option<&PiperParams>)
        -> Result<BatchAudio>;
}

/// One way of turning text into a WAV file with a resolved model.
pub trait SynthesisStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn synthesize(
        &self,
        text: &str,
        model: &ResolvedModel,
        out: &Path,
        params: &PiperParams,
    ) -> Result<()>;
}

pub struct InProcessStrategy {
    runtime: Box<dyn VoiceRuntime>,
    capability: RuntimeCapability,
}

impl InProcessStrategy {
    pub fn new(runtime: Box<dyn VoiceRuntime>) -> Self {
        let capability = runtime.capability();
        tracing::debug!(runtime = runtime.name(), ?capability, "Voice runtime detected");
        Self {
            runtime,
            capability,
        }
    }
}

fn wav_spec(sample_rate: u32) -> hound::WavSpec {
    hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    }
}

fn wav_error(e: hound::Error) -> TtsError {
    match e {
        hound::Error::IoError(io) => TtsError::Io(io),
        other => TtsError::Runtime(format!("WAV write failed: {}", other)),
    }
}

impl SynthesisStrategy for InProcessStrategy {
    fn name(&self) -> &str {
        self.runtime.name()
    }

    fn synthesize(
        &self,
        text: &str,
        model: &ResolvedModel,
        out: &Path,
        params: &PiperParams,
    ) -> Result<()> {
        let mut voice = self.runtime.load(model)?;
        let params = if self.capability.accepts_params() {
            Some(params)
        } else {
            None
        };

        match self.capability {
            RuntimeCapability::Streaming { .. } => {
                let mut writer =
                    hound::WavWriter::create(out, wav_spec(voice.sample_rate())).map_err(wav_error)?;
                voice.synthesize_stream(text, params, &mut |chunk: &[i16]| {
                    for &sample in chunk {
                        writer.write_sample(sample).map_err(wav_error)?;
                    }
                    Ok(())
                })?;
                writer.finalize().map_err(wav_error)?;
            }
            RuntimeCapability::Batch { .. } => match voice.synthesize_batch(text, params)? {
                BatchAudio::Wav(bytes) => std::fs::write(out, bytes)?,
                BatchAudio::Pcm {
                    samples,
                    sample_rate,
                } => {
                    let mut writer =
                        hound::WavWriter::create(out, wav_spec(sample_rate)).map_err(wav_error)?;
                    for sample in samples {
                        writer.write_sample(sample).map_err(wav_error)?;
                    }
                    writer.finalize().map_err(wav_error)?;
                }
            },
        }
        Ok(())
    }
}

/// Runs the `piper` executable with the text on stdin.
pub struct ExternalCliStrategy {
    binary: String,
}

impl ExternalCliStrategy {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(
        &self,
        bin: &Path,
        model: &ResolvedModel,
        out: &Path,
        params: &PiperParams,
    ) -> Command {
        let mut cmd = Command::new(bin);
        cmd.arg("--model")
            .arg(&model.model)
            .arg("--config")
            .arg(&model.config)
            .arg("--output_file")
            .arg(out);
        if let Some(v) = params.length_scale {
            cmd.arg("--length_scale").arg(v.to_string());
        }
        if let Some(v) = params.noise_scale {
            cmd.arg("--noise_scale").arg(v.to_string());
        }
        if let Some(v) = params.noise_w {
            cmd.arg("--noise_w").arg(v.to_string());
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

impl SynthesisStrategy for ExternalCliStrategy {
    fn name(&self) -> &str {
        "piper-cli"
    }

    fn synthesize(
        &self,
        text: &str,
        model: &ResolvedModel,
        out: &Path,
        params: &PiperParams,
    ) -> Result<()> {
        let bin = find_on_path(&self.binary)
            .ok_or_else(|| TtsError::ExternalToolMissing(self.binary.clone()))?;

        let mut cmd = self.command(&bin, model, out, params);
        tracing::debug!(command = ?cmd, "Running piper");
        let child = cmd.spawn()?;
        let output = run_with_input(child, format!("{}\n", text).into_bytes())?;
        if output.status.success() {
            Ok(())
        } else {
            Err(TtsError::ExternalToolFailed {
                tool: self.binary.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

/// Rejects files that cannot be a Piper model before anything loads them.
pub fn validate_model(model: &ResolvedModel) -> Result<()> {
    if !model.model.is_file() {
        return Err(TtsError::InvalidArgument(format!(
            "Piper model not found: {}",
            model.model.display()
        )));
    }

    let head = model_repo::read_head(&model.model)?;
    if head.starts_with(&GZIP_MAGIC) {
        return Err(TtsError::InvalidModelArtifact {
            path: model.model.clone(),
            reason: "is gzip-compressed; decompress it before use".to_string(),
        });
    }
    if let Some(reason) = model_repo::placeholder_reason(&head) {
        return Err(TtsError::InvalidModelArtifact {
            path: model.model.clone(),
            reason: reason.to_string(),
        });
    }
    if !model.config.is_file() {
        return Err(TtsError::InvalidModelArtifact {
            path: model.model.clone(),
            reason: format!("is missing its sidecar {}", model.config.display()),
        });
    }
    Ok(())
}

/// Strategies used when none are given: the in-process runtime when built
/// with the `onnx` feature, then the `piper` executable.
pub fn default_strategies(piper_binary: &str, espeak_binary: &str) -> Vec<Box<dyn SynthesisStrategy>> {
    let mut strategies: Vec<Box<dyn SynthesisStrategy>> = Vec::new();
    #[cfg(feature = "onnx")]
    strategies.push(Box::new(InProcessStrategy::new(Box::new(
        super::piper_onnx::OnnxRuntime::new(espeak_binary),
    ))));
    #[cfg(not(feature = "onnx"))]
    let _ = espeak_binary;
    strategies.push(Box::new(ExternalCliStrategy::new(piper_binary)));
    strategies
}

pub struct PiperAdapter {
    repo: ModelRepository,
    strategies: Vec<Box<dyn SynthesisStrategy>>,
}

impl PiperAdapter {
    pub fn new(repo: ModelRepository, strategies: Vec<Box<dyn SynthesisStrategy>>) -> Self {
        Self { repo, strategies }
    }

    /// Symbolic keys go through the model repository (downloading on first
    /// use); anything containing a path separator, or naming an existing
    /// file, is a direct path.
    pub fn resolve(&self, reference: &str) -> Result<ResolvedModel> {
        let is_bare = !reference.contains('/') && !reference.contains('\\');
        if is_bare {
            if model_repo::find_entry(reference).is_some() {
                let (model, config) = self.repo.ensure_model(reference)?;
                return Ok(ResolvedModel { model, config });
            }
            if !Path::new(reference).is_file() {
                return Err(TtsError::UnknownModelKey(reference.to_string()));
            }
        }
        Ok(ResolvedModel::from_model_path(reference))
    }

    /// Synthesizes `text` with the voice `reference` into `out`.
    pub fn tts_piper(
        &self,
        text: &str,
        reference: &str,
        out: &Path,
        params: &PiperParams,
    ) -> Result<PathBuf> {
        let model = self.resolve(reference)?;
        validate_model(&model)?;

        if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut last_err = None;
        for strategy in &self.strategies {
            let attempt = strategy
                .synthesize(text, &model, out, params)
                .and_then(|()| {
                    if file_has_content(out) {
                        Ok(())
                    } else {
                        Err(TtsError::SynthesisProducedNoOutput {
                            backend: "piper",
                            path: out.to_path_buf(),
                        })
                    }
                });
            match attempt {
                Ok(()) => {
                    tracing::info!(strategy = strategy.name(), out = %out.display(), "Piper synthesis done");
                    return Ok(out.to_path_buf());
                }
                Err(e) => {
                    tracing::warn!(strategy = strategy.name(), error = %e, "Piper strategy failed");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            TtsError::InvalidArgument("No Piper synthesis strategy configured".to_string())
        }))
    }
}
