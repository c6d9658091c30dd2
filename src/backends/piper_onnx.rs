//! In-process Piper inference with ONNX Runtime. Text is phonemized by
//! `espeak-ng --ipa` and mapped through the voice's `phoneme_id_map`;
//! audio is produced one sentence at a time.

use super::piper::{
    BatchAudio, LoadedVoice, PiperParams, ResolvedModel, RuntimeCapability, VoiceRuntime,
};
use super::run_with_input;
use crate::error::{Result, TtsError};
use ndarray::{arr1, Array2};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::{Session, SessionInputValue, SessionInputs};
use ort::value::TensorRef;
use serde::Deserialize;
use std::borrow::Cow;
use std::collections::HashMap;
use std::process::{Command, Stdio};

const BOS: &str = "^";
const EOS: &str = "$";
const PAD: &str = "_";

#[derive(Debug, Deserialize)]
struct AudioConfig {
    sample_rate: u32,
}

#[derive(Debug, Deserialize)]
struct EspeakConfig {
    voice: String,
}

#[derive(Debug, Deserialize)]
struct InferenceConfig {
    #[serde(default = "default_noise_scale")]
    noise_scale: f32,
    #[serde(default = "default_length_scale")]
    length_scale: f32,
    #[serde(default = "default_noise_w")]
    noise_w: f32,
}

fn default_noise_scale() -> f32 {
    0.667
}

fn default_length_scale() -> f32 {
    1.0
}

fn default_noise_w() -> f32 {
    0.8
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            noise_scale: default_noise_scale(),
            length_scale: default_length_scale(),
            noise_w: default_noise_w(),
        }
    }
}

/// The parts of a Piper `.onnx.json` sidecar needed for inference.
#[derive(Debug, Deserialize)]
pub struct VoiceConfig {
    audio: AudioConfig,
    espeak: EspeakConfig,
    #[serde(default)]
    inference: InferenceConfig,
    phoneme_id_map: HashMap<String, Vec<i64>>,
}

impl VoiceConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| TtsError::Runtime(format!("Invalid voice config: {}", e)))
    }

    /// Phoneme ids framed the way Piper voices are trained:
    /// `^ _ p1 _ p2 _ ... $`. Unknown phonemes are dropped.
    pub fn phoneme_ids(&self, phonemes: &str) -> Vec<i64> {
        let pad = self.id_of(PAD);
        let mut ids = self.id_of(BOS);
        ids.extend_from_slice(&pad);
        for ch in phonemes.chars() {
            let mut buf = [0u8; 4];
            if let Some(mapped) = self.phoneme_id_map.get(ch.encode_utf8(&mut buf) as &str) {
                ids.extend_from_slice(mapped);
                ids.extend_from_slice(&pad);
            }
        }
        ids.extend(self.id_of(EOS));
        ids
    }

    fn id_of(&self, symbol: &str) -> Vec<i64> {
        self.phoneme_id_map.get(symbol).cloned().unwrap_or_default()
    }

    fn scales(&self, params: Option<&PiperParams>) -> [f32; 3] {
        let p = params.copied().unwrap_or_default();
        [
            p.noise_scale.unwrap_or(self.inference.noise_scale),
            p.length_scale.unwrap_or(self.inference.length_scale),
            p.noise_w.unwrap_or(self.inference.noise_w),
        ]
    }
}

/// Scales float audio to the full i16 range, as Piper does.
pub fn to_pcm16(audio: &[f32]) -> Vec<i16> {
    let peak = audio.iter().fold(0.01f32, |acc, s| acc.max(s.abs()));
    let gain = 32767.0 / peak;
    audio
        .iter()
        .map(|s| (s * gain).clamp(-32768.0, 32767.0) as i16)
        .collect()
}

fn ort_error(e: ort::Error) -> TtsError {
    TtsError::Runtime(e.to_string())
}

pub struct OnnxRuntime {
    espeak_binary: String,
}

impl OnnxRuntime {
    pub fn new(espeak_binary: impl Into<String>) -> Self {
        Self {
            espeak_binary: espeak_binary.into(),
        }
    }
}

impl VoiceRuntime for OnnxRuntime {
    fn name(&self) -> &'static str {
        "piper-onnx"
    }

    fn capability(&self) -> RuntimeCapability {
        RuntimeCapability::Streaming {
            accepts_params: true,
        }
    }

    fn load(&self, model: &ResolvedModel) -> Result<Box<dyn LoadedVoice>> {
        let config = VoiceConfig::from_json(&std::fs::read_to_string(&model.config)?)?;
        tracing::info!(model = %model.model.display(), "Loading Piper voice");

        let session = Session::builder()
            .map_err(ort_error)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(ort_error)?
            .commit_from_file(&model.model)
            .map_err(ort_error)?;

        // Multi-speaker voices take a speaker id; older exports lack scales.
        let has_sid = session.inputs().iter().any(|i| i.name() == "sid");
        let has_scales = session.inputs().iter().any(|i| i.name() == "scales");
        tracing::debug!(has_sid, has_scales, "Detected voice inputs");

        Ok(Box::new(OnnxVoice {
            session,
            config,
            espeak_binary: self.espeak_binary.clone(),
            has_sid,
            has_scales,
        }))
    }
}

struct OnnxVoice {
    session: Session,
    config: VoiceConfig,
    espeak_binary: String,
    has_sid: bool,
    has_scales: bool,
}

impl OnnxVoice {
    /// One IPA line per sentence, as `espeak-ng` prints them.
    fn phonemize(&self, text: &str) -> Result<Vec<String>> {
        let child = Command::new(&self.espeak_binary)
            .args(["--ipa", "--stdin", "-q", "-v", &self.config.espeak.voice])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    TtsError::ExternalToolMissing(self.espeak_binary.clone())
                } else {
                    TtsError::Io(e)
                }
            })?;

        let output = run_with_input(child, format!("{}\n", text).into_bytes())?;
        if !output.status.success() {
            return Err(TtsError::ExternalToolFailed {
                tool: self.espeak_binary.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let ipa = String::from_utf8_lossy(&output.stdout);
        Ok(ipa
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect())
    }

    fn infer(&mut self, ids: Vec<i64>, scales: [f32; 3]) -> Result<Vec<f32>> {
        let len = ids.len();
        let input = Array2::from_shape_vec((1, len), ids)
            .map_err(|e| TtsError::Runtime(e.to_string()))?;
        let lengths = arr1(&[len as i64]);
        let scales = arr1(&scales);
        let sid = arr1(&[0i64]);

        let mut feed: Vec<(Cow<'_, str>, SessionInputValue<'_>)> = vec![
            (
                "input".into(),
                TensorRef::from_array_view(input.view()).map_err(ort_error)?.into(),
            ),
            (
                "input_lengths".into(),
                TensorRef::from_array_view(lengths.view()).map_err(ort_error)?.into(),
            ),
        ];
        if self.has_scales {
            feed.push((
                "scales".into(),
                TensorRef::from_array_view(scales.view()).map_err(ort_error)?.into(),
            ));
        }
        if self.has_sid {
            feed.push((
                "sid".into(),
                TensorRef::from_array_view(sid.view()).map_err(ort_error)?.into(),
            ));
        }

        let outputs = self.session.run(SessionInputs::from(feed)).map_err(ort_error)?;
        let (_, first) = outputs
            .iter()
            .next()
            .ok_or_else(|| TtsError::Runtime("No output from model".to_string()))?;
        let audio = first.try_extract_array::<f32>().map_err(ort_error)?;
        Ok(audio.iter().copied().collect())
    }
}

impl LoadedVoice for OnnxVoice {
    fn sample_rate(&self) -> u32 {
        self.config.audio.sample_rate
    }

    fn synthesize_stream(
        &mut self,
        text: &str,
        params: Option<&PiperParams>,
        on_chunk: &mut dyn FnMut(&[i16]) -> Result<()>,
    ) -> Result<()> {
        let scales = self.config.scales(params);
        for sentence in self.phonemize(text)? {
            let ids = self.config.phoneme_ids(&sentence);
            let audio = self.infer(ids, scales)?;
            on_chunk(&to_pcm16(&audio))?;
        }
        Ok(())
    }

    fn synthesize_batch(
        &mut self,
        text: &str,
        params: Option<&PiperParams>,
    ) -> Result<BatchAudio> {
        let mut samples = Vec::new();
        self.synthesize_stream(text, params, &mut |chunk: &[i16]| {
            samples.extend_from_slice(chunk);
            Ok(())
        })?;
        Ok(BatchAudio::Pcm {
            samples,
            sample_rate: self.config.audio.sample_rate,
        })
    }
}
