use crate::engine::file_has_content;
use crate::error::{Result, TtsError};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

/// Longest piece of text the endpoint accepts per request.
pub const MAX_PIECE_CHARS: usize = 100;

/// Cloud text-to-speech over the Google Translate speech endpoint.
///
/// Text is split into pieces of at most `MAX_PIECE_CHARS` characters; each
/// piece is fetched as MP3 and the bodies are appended into one file.
pub struct CloudTts {
    base_url: String,
    timeout: Duration,
    client: OnceLock<reqwest::blocking::Client>,
}

impl CloudTts {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(30),
            client: OnceLock::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    // Built on first use: a blocking client must not be created inside a
    // tokio runtime.
    fn client(&self) -> Result<&reqwest::blocking::Client> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()?;
        Ok(self.client.get_or_init(|| client))
    }

    /// Writes MP3 audio for `text` in language `lang` to `out`.
    pub fn synthesize(&self, text: &str, lang: &str, out: &Path) -> Result<PathBuf> {
        let pieces = split_text(text, MAX_PIECE_CHARS);
        if pieces.is_empty() {
            return Err(TtsError::InvalidArgument(
                "No text to send to the cloud backend".into(),
            ));
        }

        tracing::info!(pieces = pieces.len(), lang, "Requesting cloud speech");
        // Audio is collected next to `out` and only replaces it once every
        // piece has arrived.
        let dir = out
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        let total = pieces.len().to_string();
        for (idx, piece) in pieces.iter().enumerate() {
            let resp = self
                .client()?
                .get(&self.base_url)
                .query(&[
                    ("ie", "UTF-8"),
                    ("q", piece.as_str()),
                    ("tl", lang),
                    ("total", total.as_str()),
                    ("idx", idx.to_string().as_str()),
                    ("textlen", piece.chars().count().to_string().as_str()),
                    ("client", "tw-ob"),
                ])
                .send()?
                .error_for_status()?;
            file.write_all(&resp.bytes()?)?;
        }
        file.flush()?;
        file.persist(out).map_err(|e| TtsError::Io(e.error))?;

        if !file_has_content(out) {
            return Err(TtsError::SynthesisProducedNoOutput {
                backend: "gtts",
                path: out.to_path_buf(),
            });
        }
        Ok(out.to_path_buf())
    }
}

/// Splits `text` at whitespace into pieces of at most `max_chars`
/// characters. Words longer than the limit are cut.
pub fn split_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for word in text.split_whitespace() {
        let word_len = word.chars().count();
        let needed = if current.is_empty() {
            word_len
        } else {
            current_len + 1 + word_len
        };

        if needed <= max_chars {
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(word);
            current_len = needed;
            continue;
        }

        if !current.is_empty() {
            pieces.push(std::mem::take(&mut current));
            current_len = 0;
        }

        if word_len <= max_chars {
            current.push_str(word);
            current_len = word_len;
        } else {
            let chars: Vec<char> = word.chars().collect();
            for part in chars.chunks(max_chars) {
                pieces.push(part.iter().collect());
            }
        }
    }

    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}
