//! Offline-engine session: one local speech driver, used by one synthesis
//! at a time, with every call bounded by a length-dependent timeout.

use crate::backends::{DriverEvent, SpeechDriver, Voice};
use crate::error::{Result, TtsError};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

/// Lower bound of the per-call timeout, in seconds.
pub const MIN_TIMEOUT_SECS: f64 = 4.0;
pub const DEFAULT_TIMEOUT_PER_1K_CHARS: f64 = 6.0;

/// Some drivers are slow to flush; the output file is polled this many
/// times, `OUTPUT_POLL_INTERVAL` apart, after the loop ends.
pub const OUTPUT_POLL_ATTEMPTS: u32 = 50;
pub const OUTPUT_POLL_INTERVAL: Duration = Duration::from_millis(50);

const PUMP_INTERVAL: Duration = Duration::from_millis(10);

/// Timeout for synthesizing `text_chars` characters:
/// `max(4.0, chars / 1000 * per_1k_chars)` seconds.
pub fn synthesis_timeout(text_chars: usize, per_1k_chars: f64) -> Duration {
    let secs = f64::max(MIN_TIMEOUT_SECS, text_chars as f64 / 1000.0 * per_1k_chars);
    Duration::from_secs_f64(secs)
}

/// First voice, in enumeration order, whose name or one of whose declared
/// languages contains `lang` (case-insensitive).
pub fn select_voice<'a>(voices: &'a [Voice], lang: &str) -> Option<&'a Voice> {
    let wanted = lang.to_lowercase();
    voices.iter().find(|voice| {
        voice.name.to_lowercase().contains(&wanted)
            || voice
                .languages
                .iter()
                .any(|l| l.to_lowercase().contains(&wanted))
    })
}

/// Ends the event loop and stops the driver however the pump exits.
struct LoopGuard<'a> {
    driver: &'a mut dyn SpeechDriver,
}

impl Drop for LoopGuard<'_> {
    fn drop(&mut self) {
        self.driver.end_loop();
        self.driver.stop();
    }
}

pub struct OfflineEngine {
    driver: Mutex<Box<dyn SpeechDriver>>,
    backend: &'static str,
    timeout_per_1k_chars: f64,
}

impl OfflineEngine {
    pub fn new(driver: Box<dyn SpeechDriver>) -> Self {
        let backend = driver.id();
        tracing::info!(driver = backend, "Offline engine initialized");
        Self {
            driver: Mutex::new(driver),
            backend,
            timeout_per_1k_chars: DEFAULT_TIMEOUT_PER_1K_CHARS,
        }
    }

    pub fn with_timeout_per_1k_chars(mut self, secs: f64) -> Self {
        self.timeout_per_1k_chars = secs;
        self
    }

    fn lock_driver(&self) -> MutexGuard<'_, Box<dyn SpeechDriver>> {
        // A panic mid-synthesis leaves the driver stopped by LoopGuard, so
        // the handle is still usable.
        self.driver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Renders `text` into a WAV file at `out` and returns that path.
    pub fn synthesize_to_wav(
        &self,
        text: &str,
        out: &Path,
        voice_lang: Option<&str>,
    ) -> Result<PathBuf> {
        let timeout = synthesis_timeout(text.chars().count(), self.timeout_per_1k_chars);

        {
            let mut driver = self.lock_driver();

            if let Some(lang) = voice_lang.filter(|l| !l.is_empty()) {
                match driver.list_voices() {
                    Ok(voices) => match select_voice(&voices, lang) {
                        Some(voice) => {
                            tracing::debug!(voice = %voice.id, lang, "Selected voice");
                            driver.set_voice(&voice.id);
                        }
                        None => tracing::debug!(lang, "No matching voice, using default"),
                    },
                    Err(e) => tracing::warn!(error = %e, "Could not list voices"),
                }
            }

            let mut guard = LoopGuard {
                driver: &mut **driver,
            };
            guard.driver.save_to_file(text, out)?;
            guard.driver.start_loop()?;
            pump_until_finished(&mut *guard.driver, timeout, self.backend)?;
        }

        wait_for_output(out, self.backend)
    }
}

impl Drop for OfflineEngine {
    fn drop(&mut self) {
        self.lock_driver().stop();
    }
}

fn pump_until_finished(
    driver: &mut dyn SpeechDriver,
    timeout: Duration,
    backend: &'static str,
) -> Result<()> {
    let started = Instant::now();
    let mut finished = false;
    loop {
        for event in driver.iterate()? {
            if let DriverEvent::FinishedUtterance { completed } = event {
                if !completed {
                    tracing::warn!(backend, "Utterance did not complete cleanly");
                }
                finished = true;
            }
        }
        if finished {
            return Ok(());
        }
        if started.elapsed() > timeout {
            return Err(TtsError::Timeout { backend, timeout });
        }
        thread::sleep(PUMP_INTERVAL);
    }
}

fn wait_for_output(out: &Path, backend: &'static str) -> Result<PathBuf> {
    for _ in 0..OUTPUT_POLL_ATTEMPTS {
        if file_has_content(out) {
            return Ok(out.to_path_buf());
        }
        thread::sleep(OUTPUT_POLL_INTERVAL);
    }
    Err(TtsError::SynthesisProducedNoOutput {
        backend,
        path: out.to_path_buf(),
    })
}

pub(crate) fn file_has_content(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}
