use config::{Config, File};
use lazy_static::lazy_static;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::RwLock;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    // Storage
    pub output_dir: String,
    pub models_dir: String,
    // Model store
    pub model_base_url: String,
    pub min_model_size_bytes: u64,
    pub download_timeout_secs: u64,
    // Engines
    pub piper_binary: String,
    pub espeak_binary: String,
    pub cloud_tts_url: String,
    pub offline_timeout_per_1k_chars: f64,
    // Front-end defaults
    pub default_backend: String,
    pub default_lang: String,
    pub chunk_size: usize,
    pub ocr_lang: String,
    // HTTP API
    pub server_host: String,
    pub server_port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            output_dir: "data".to_string(),
            models_dir: "models".to_string(),
            model_base_url: "https://huggingface.co/rhasspy/piper-voices/resolve/main".to_string(),
            min_model_size_bytes: 1024 * 1024,
            download_timeout_secs: 60,
            piper_binary: "piper".to_string(),
            espeak_binary: "espeak-ng".to_string(),
            cloud_tts_url: "https://translate.google.com/translate_tts".to_string(),
            offline_timeout_per_1k_chars: 6.0,
            default_backend: "gtts".to_string(),
            default_lang: "en".to_string(),
            chunk_size: 1200,
            ocr_lang: "eng+deu".to_string(),
            server_host: "0.0.0.0".to_string(),
            server_port: 8000,
        }
    }
}

lazy_static! {
    pub static ref SETTINGS: RwLock<Settings> =
        RwLock::new(Settings::new().expect("Failed to load settings"));
}

impl Settings {
    pub fn new() -> Result<Self, config::ConfigError> {
        let defaults = Settings::default();
        let builder = Config::builder()
            .set_default("output_dir", defaults.output_dir)?
            .set_default("models_dir", defaults.models_dir)?
            .set_default("model_base_url", defaults.model_base_url)?
            .set_default("min_model_size_bytes", defaults.min_model_size_bytes as i64)?
            .set_default("download_timeout_secs", defaults.download_timeout_secs as i64)?
            .set_default("piper_binary", defaults.piper_binary)?
            .set_default("espeak_binary", defaults.espeak_binary)?
            .set_default("cloud_tts_url", defaults.cloud_tts_url)?
            .set_default(
                "offline_timeout_per_1k_chars",
                defaults.offline_timeout_per_1k_chars,
            )?
            .set_default("default_backend", defaults.default_backend)?
            .set_default("default_lang", defaults.default_lang)?
            .set_default("chunk_size", defaults.chunk_size as i64)?
            .set_default("ocr_lang", defaults.ocr_lang)?
            .set_default("server_host", defaults.server_host)?
            .set_default("server_port", defaults.server_port as i64)?
            // Merge with local config file (if exists)
            .add_source(File::with_name("Text2Audio").required(false))
            .add_source(
                File::with_name(&format!(
                    "{}/.config/text2audio/Text2Audio",
                    std::env::var("HOME").unwrap_or_default()
                ))
                .required(false),
            )
            // Merge with environment variables (e.g. TEXT2AUDIO_OUTPUT_DIR)
            .add_source(config::Environment::with_prefix("TEXT2AUDIO"));

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), config::ConfigError> {
        if !(200..=8000).contains(&self.chunk_size) {
            return Err(config::ConfigError::Message(format!(
                "Invalid chunk_size: {}. Must be between 200 and 8000",
                self.chunk_size
            )));
        }
        if self.offline_timeout_per_1k_chars <= 0.0 {
            return Err(config::ConfigError::Message(
                "offline_timeout_per_1k_chars must be positive".to_string(),
            ));
        }
        if self.download_timeout_secs == 0 {
            return Err(config::ConfigError::Message(
                "download_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.server_port == 0 {
            return Err(config::ConfigError::Message(
                "server_port must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Output directory with a leading `~/` expanded.
    pub fn output_dir(&self) -> PathBuf {
        expand_home(&self.output_dir)
    }

    pub fn models_dir(&self) -> PathBuf {
        expand_home(&self.models_dir)
    }
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}
