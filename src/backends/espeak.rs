use super::{feed_stdin, DriverEvent, SpeechDriver, Voice};

use std::collections::VecDeque;
use std::io::{Error, ErrorKind, Result};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use wait_timeout::ChildExt;

struct Utterance {
    text: String,
    out: PathBuf,
    voice: Option<String>,
}

/// Local speech driver on top of the `espeak-ng` executable.
///
/// Each queued utterance becomes one `espeak-ng -w` process; `iterate`
/// starts the next process or polls the running one without blocking.
pub struct EspeakDriver {
    binary: String,
    voice: Option<String>,
    queue: VecDeque<Utterance>,
    current: Option<Child>,
    looping: bool,
}

impl EspeakDriver {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            voice: None,
            queue: VecDeque::new(),
            current: None,
            looping: false,
        }
    }

    fn spawn(&self, utterance: &Utterance) -> Result<Child> {
        let mut cmd = Command::new(&self.binary);
        if let Some(voice) = &utterance.voice {
            cmd.arg("-v").arg(voice);
        }
        cmd.arg("-w")
            .arg(&utterance.out)
            .arg("--stdin")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        tracing::debug!(command = ?cmd, "Running espeak-ng");
        let mut child = cmd.spawn()?;
        // The writer ends on its own once the text is consumed or the child
        // is killed by `stop`.
        drop(feed_stdin(
            &mut child,
            format!("{}\n", utterance.text).into_bytes(),
        ));
        Ok(child)
    }
}

impl Default for EspeakDriver {
    fn default() -> Self {
        Self::new("espeak-ng")
    }
}

impl SpeechDriver for EspeakDriver {
    fn id(&self) -> &'static str {
        "espeak-ng"
    }

    fn list_voices(&mut self) -> Result<Vec<Voice>> {
        let mut child = Command::new(&self.binary)
            .arg("--voices")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // Wait for 5 seconds max
        match child.wait_timeout(Duration::from_secs(5))? {
            Some(status) => {
                let output = child.wait_with_output()?;
                if status.success() {
                    Ok(parse_voice_list(&String::from_utf8_lossy(&output.stdout)))
                } else {
                    let err_msg = String::from_utf8_lossy(&output.stderr);
                    Err(Error::new(
                        ErrorKind::Other,
                        format!("espeak error: {}", err_msg),
                    ))
                }
            }
            None => {
                let _ = child.kill();
                let _ = child.wait();
                Err(Error::new(
                    ErrorKind::TimedOut,
                    "Listing voices timed out after 5s",
                ))
            }
        }
    }

    fn set_voice(&mut self, voice_id: &str) {
        self.voice = Some(voice_id.to_string());
    }

    fn save_to_file(&mut self, text: &str, out: &Path) -> Result<()> {
        self.queue.push_back(Utterance {
            text: text.to_string(),
            out: out.to_path_buf(),
            voice: self.voice.clone(),
        });
        Ok(())
    }

    fn start_loop(&mut self) -> Result<()> {
        self.looping = true;
        Ok(())
    }

    fn iterate(&mut self) -> Result<Vec<DriverEvent>> {
        if !self.looping {
            return Err(Error::new(ErrorKind::Other, "event loop not started"));
        }

        if let Some(child) = self.current.as_mut() {
            return match child.try_wait()? {
                Some(status) => {
                    if !status.success() {
                        tracing::warn!(%status, "espeak-ng exited unsuccessfully");
                    }
                    self.current = None;
                    Ok(vec![DriverEvent::FinishedUtterance {
                        completed: status.success(),
                    }])
                }
                None => Ok(Vec::new()),
            };
        }

        match self.queue.pop_front() {
            Some(utterance) => {
                self.current = Some(self.spawn(&utterance)?);
                Ok(vec![DriverEvent::StartedUtterance])
            }
            None => Ok(Vec::new()),
        }
    }

    fn end_loop(&mut self) {
        self.looping = false;
    }

    fn stop(&mut self) {
        if let Some(mut child) = self.current.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        self.queue.clear();
    }
}

impl Drop for EspeakDriver {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Parses the table printed by `espeak-ng --voices`.
///
/// ```text
/// Pty Language       Age/Gender VoiceName          File                 Other Languages
///  5  en-us           --/M      English_(America)  gmw/en-US            (en 10)
/// ```
pub fn parse_voice_list(output: &str) -> Vec<Voice> {
    output
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("Pty"))
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 5 {
                return None;
            }
            let mut languages = vec![cols[1].to_string()];
            // Other Languages come as "(code priority)" pairs
            languages.extend(
                cols[5..]
                    .chunks(2)
                    .filter_map(|pair| pair.first())
                    .map(|code| code.trim_start_matches('(').to_string()),
            );
            Some(Voice {
                id: cols[4].to_string(),
                name: cols[3].replace('_', " "),
                languages,
            })
        })
        .collect()
}
