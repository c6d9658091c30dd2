pub mod espeak;
pub mod gtts;
pub mod piper;
#[cfg(feature = "onnx")]
pub mod piper_onnx;

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Output};
use std::thread::{self, JoinHandle};

/// Represents a voice offered by a local speech driver
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Voice {
    pub id: String,
    pub name: String,
    pub languages: Vec<String>,
}

/// Events reported by one pump of a driver's event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverEvent {
    StartedUtterance,
    FinishedUtterance { completed: bool },
}

/// Trait that local speech drivers must implement.
///
/// Drivers are callback-free and non-blocking: work is queued with
/// `save_to_file`, the loop is armed with `start_loop`, and each call to
/// `iterate` advances it by one step and returns whatever happened.
pub trait SpeechDriver: Send {
    /// Returns the unique ID of the driver (e.g., "espeak-ng")
    fn id(&self) -> &'static str;

    /// Returns the voices the driver can use, in enumeration order
    fn list_voices(&mut self) -> io::Result<Vec<Voice>>;

    /// Selects the voice used for utterances queued afterwards
    fn set_voice(&mut self, voice_id: &str);

    /// Queues `text` to be rendered into a WAV file at `out`
    fn save_to_file(&mut self, text: &str, out: &Path) -> io::Result<()>;

    fn start_loop(&mut self) -> io::Result<()>;

    /// Pumps one iteration of the event loop
    fn iterate(&mut self) -> io::Result<Vec<DriverEvent>>;

    fn end_loop(&mut self);

    /// Aborts any utterance in progress and clears the queue
    fn stop(&mut self);
}

/// Locates an executable: path-like names are checked directly, bare names
/// are searched on PATH.
pub fn find_on_path(bin: &str) -> Option<PathBuf> {
    if bin.contains(std::path::MAIN_SEPARATOR) || bin.contains('/') {
        let p = PathBuf::from(bin);
        return if p.is_file() { Some(p) } else { None };
    }

    if let Some(paths_os) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths_os) {
            let candidate = dir.join(bin);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

/// Hands `input` to the child's stdin on a separate thread and closes it
/// afterwards, so the caller is free to drain stdout and stderr.
pub(crate) fn feed_stdin(child: &mut Child, input: Vec<u8>) -> JoinHandle<io::Result<()>> {
    let stdin = child.stdin.take();
    thread::spawn(move || {
        if let Some(mut stdin) = stdin {
            stdin.write_all(&input)?;
        }
        Ok(())
    })
}

/// Runs a spawned child to completion with `input` on its stdin while its
/// piped output is collected.
///
/// A child that exits unsuccessfully is reported through its status and
/// stderr even if it stopped reading early; a write error only surfaces
/// when the child claims success.
pub(crate) fn run_with_input(mut child: Child, input: Vec<u8>) -> io::Result<Output> {
    let writer = feed_stdin(&mut child, input);
    let output = child.wait_with_output()?;
    let written = writer
        .join()
        .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::Other, "stdin writer panicked")));
    match written {
        Err(e) if output.status.success() => Err(e),
        _ => Ok(output),
    }
}
