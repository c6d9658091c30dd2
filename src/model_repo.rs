//! Static registry of Piper voices and the download logic that fetches a
//! voice's model and sidecar on first use.

use crate::error::{Result, TtsError};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use tempfile::NamedTempFile;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://huggingface.co/rhasspy/piper-voices/resolve/main";

/// Anything smaller than this cannot be a real voice model.
pub const DEFAULT_MIN_MODEL_SIZE: u64 = 1024 * 1024;

const READ_CHUNK: usize = 256 * 1024;
const SNIFF_LEN: usize = 256;

/// One registered voice: its symbolic key and where it lives remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelEntry {
    pub key: &'static str,
    pub remote_dir: &'static str,
    pub base_name: &'static str,
}

pub const MODELS: &[ModelEntry] = &[
    ModelEntry {
        key: "Thorsten (DE)",
        remote_dir: "de/de_DE/thorsten/high",
        base_name: "de_DE-thorsten-high",
    },
    ModelEntry {
        key: "Karlsson (DE)",
        remote_dir: "de/de_DE/karlsson/low",
        base_name: "de_DE-karlsson-low",
    },
    ModelEntry {
        key: "Amy (US)",
        remote_dir: "en/en_US/amy/medium",
        base_name: "en_US-amy-medium",
    },
    ModelEntry {
        key: "Libri (US)",
        remote_dir: "en/en_US/libritts_r/medium",
        base_name: "en_US-libritts_r-medium",
    },
];

pub fn find_entry(key: &str) -> Option<&'static ModelEntry> {
    MODELS.iter().find(|entry| entry.key == key)
}

/// Registered keys, sorted.
pub fn model_keys() -> Vec<&'static str> {
    let mut keys: Vec<&'static str> = MODELS.iter().map(|entry| entry.key).collect();
    keys.sort_unstable();
    keys
}

/// Why the first bytes of a file cannot be a model, if they cannot.
pub fn placeholder_reason(head: &[u8]) -> Option<&'static str> {
    if head.starts_with(b"version https://git-lfs") {
        return Some("is a git-lfs pointer, not the model itself");
    }
    let lower = String::from_utf8_lossy(head).to_lowercase();
    if lower.contains("<html") || lower.trim_start().starts_with("<!doctype html") {
        return Some("looks like an HTML page, not a model");
    }
    None
}

pub(crate) fn read_head(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut head = Vec::with_capacity(SNIFF_LEN);
    File::open(path)?
        .take(SNIFF_LEN as u64)
        .read_to_end(&mut head)?;
    Ok(head)
}

pub struct ModelRepository {
    models_dir: PathBuf,
    base_url: String,
    min_model_size: u64,
    timeout: Duration,
    client: OnceLock<reqwest::blocking::Client>,
    // Serializes first-use fetches so one download finishes before the
    // next caller looks at the disk again.
    fetch_lock: Mutex<()>,
}

impl ModelRepository {
    pub fn new(models_dir: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            models_dir: models_dir.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            min_model_size: DEFAULT_MIN_MODEL_SIZE,
            timeout: Duration::from_secs(60),
            client: OnceLock::new(),
            fetch_lock: Mutex::new(()),
        }
    }

    pub fn with_min_model_size(mut self, bytes: u64) -> Self {
        self.min_model_size = bytes;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn client(&self) -> Result<&reqwest::blocking::Client> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()?;
        Ok(self.client.get_or_init(|| client))
    }

    fn url(&self, entry: &ModelEntry, ext: &str) -> String {
        format!(
            "{}/{}/{}{}",
            self.base_url, entry.remote_dir, entry.base_name, ext
        )
    }

    /// Local paths of a registered voice's model and sidecar, whether or
    /// not they exist yet.
    pub fn model_files(&self, key: &str) -> Result<(PathBuf, PathBuf)> {
        let entry = find_entry(key).ok_or_else(|| TtsError::UnknownModelKey(key.to_string()))?;
        Ok((
            self.models_dir.join(format!("{}.onnx", entry.base_name)),
            self.models_dir.join(format!("{}.onnx.json", entry.base_name)),
        ))
    }

    pub fn ensure_model(&self, key: &str) -> Result<(PathBuf, PathBuf)> {
        self.ensure_model_with_progress(key, &|_: &str, _: f32| {})
    }

    /// Downloads whatever part of the voice is missing. `progress` receives a
    /// label and the completed fraction of the current file.
    pub fn ensure_model_with_progress(
        &self,
        key: &str,
        progress: &dyn Fn(&str, f32),
    ) -> Result<(PathBuf, PathBuf)> {
        let entry = find_entry(key).ok_or_else(|| TtsError::UnknownModelKey(key.to_string()))?;
        let (onnx_path, json_path) = self.model_files(key)?;
        if onnx_path.exists() && json_path.exists() {
            return Ok((onnx_path, json_path));
        }

        let _guard = self
            .fetch_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::fs::create_dir_all(&self.models_dir)?;

        if !onnx_path.exists() {
            let model = self.fetch_model(entry, progress)?;
            self.check_downloaded_model(model.path(), &onnx_path)?;
            persist(model, &onnx_path)?;
        }

        if !json_path.exists() {
            let url = self.url(entry, ".onnx.json");
            let label = format!("{}.onnx.json", entry.base_name);
            progress(&format!("Downloading {}", label), 0.0);
            let sidecar = self.download(&url, &label, progress)?;
            persist(sidecar, &json_path)?;
        }

        Ok((onnx_path, json_path))
    }

    /// Tries the plain model first, then the gzip-compressed one. The result
    /// is an unnamed file in the models directory.
    fn fetch_model(
        &self,
        entry: &ModelEntry,
        progress: &dyn Fn(&str, f32),
    ) -> Result<NamedTempFile> {
        let mut last_err = None;
        for (ext, compressed) in [(".onnx", false), (".onnx.gz", true)] {
            let url = self.url(entry, ext);
            let label = format!("{}{}", entry.base_name, ext);
            progress(&format!("Downloading {}", label), 0.0);

            let attempt = self.download(&url, &label, progress).and_then(|file| {
                if compressed {
                    progress(&format!("Decompressing {}", label), 0.0);
                    self.gunzip(file.path())
                } else {
                    Ok(file)
                }
            });

            match attempt {
                Ok(file) => return Ok(file),
                Err(e) => {
                    tracing::warn!(%url, error = %e, "Model download attempt failed");
                    last_err = Some(e);
                }
            }
        }

        Err(TtsError::Download {
            url: self.url(entry, ".onnx"),
            reason: format!(
                "no model variant could be fetched for {}: {}",
                entry.key,
                last_err.map(|e| e.to_string()).unwrap_or_default()
            ),
        })
    }

    /// Checks the downloaded bytes in `file`; errors name `dest`.
    fn check_downloaded_model(&self, file: &Path, dest: &Path) -> Result<()> {
        let head = read_head(file)?;
        if let Some(reason) = placeholder_reason(&head) {
            return Err(TtsError::InvalidModelArtifact {
                path: dest.to_path_buf(),
                reason: reason.to_string(),
            });
        }
        let size = std::fs::metadata(file)?.len();
        if size < self.min_model_size {
            return Err(TtsError::InvalidModelArtifact {
                path: dest.to_path_buf(),
                reason: format!("seems too small ({} bytes)", size),
            });
        }
        Ok(())
    }

    /// Streams `url` into a fresh temporary file in the models directory.
    /// The file is removed again when dropped without being persisted.
    fn download(
        &self,
        url: &str,
        label: &str,
        progress: &dyn Fn(&str, f32),
    ) -> Result<NamedTempFile> {
        tracing::info!(%url, "Downloading");
        let mut resp = self.client()?.get(url).send()?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(TtsError::Download {
                url: url.to_string(),
                reason: "404 Not Found".to_string(),
            });
        }
        resp = resp.error_for_status()?;

        let total = resp.content_length().unwrap_or(0);
        let mut file = NamedTempFile::new_in(&self.models_dir)?;
        let mut buf = vec![0u8; READ_CHUNK];
        let mut done: u64 = 0;
        loop {
            let n = resp.read(&mut buf)?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])?;
            done += n as u64;
            if total > 0 {
                progress(label, (done as f32 / total as f32).min(1.0));
            }
        }
        file.flush()?;
        progress(label, 1.0);
        Ok(file)
    }

    fn gunzip(&self, src: &Path) -> Result<NamedTempFile> {
        let mut decoder = flate2::read::GzDecoder::new(BufReader::new(File::open(src)?));
        let mut out = NamedTempFile::new_in(&self.models_dir)?;
        std::io::copy(&mut decoder, &mut out)?;
        out.flush()?;
        Ok(out)
    }
}

/// Moves a finished download to its final name.
fn persist(file: NamedTempFile, dest: &Path) -> Result<()> {
    file.persist(dest).map_err(|e| TtsError::Io(e.error))?;
    Ok(())
}
